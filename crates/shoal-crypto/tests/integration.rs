//! Integration tests for the box construction across protocol roles.

use shoal_core::nonce::{Cookie, Nonce};
use shoal_core::{ClientId, KEY_LENGTH};
use shoal_crypto::boxes::CryptoBox;
use shoal_crypto::csn::CombinedSequence;
use shoal_crypto::identity::{PermanentKeypair, SessionKeypair};
use shoal_crypto::validator::NonceValidator;
use shoal_crypto::CryptoError;

/// A client talking to a server session key, sealing under real envelope
/// headers with real combined sequence numbers.
#[test]
fn test_client_server_channel() {
    let client_permanent = PermanentKeypair::generate();
    let server_session = SessionKeypair::generate();

    let client_box =
        CryptoBox::new(client_permanent.secret(), &server_session.public_key()).unwrap();
    let server_box =
        CryptoBox::new(server_session.secret(), &client_permanent.public_key()).unwrap();

    let cookie = Cookie::random();
    let mut csn = CombinedSequence::random();
    let mut validator = NonceValidator::new(None);

    for i in 0..10 {
        let payload = format!("auth payload {}", i);
        let nonce = Nonce::new(cookie, ClientId(0x00), ClientId(0x00), csn.next().unwrap());

        let sealed = client_box.seal(&nonce.encode(), payload.as_bytes()).unwrap();

        // Server side: validate the header, then open
        validator
            .check_and_record(&nonce.cookie, nonce.combined_sequence())
            .unwrap();
        let opened = server_box.open(&nonce.encode(), &sealed).unwrap();
        assert_eq!(opened, payload.as_bytes());
    }
}

/// The signed-keys proof: the server seals its session key and the client's
/// permanent key under the *permanent* key, bound to the server-auth nonce.
/// The client verifies by opening with the server's well-known public key.
#[test]
fn test_signed_keys_verification() {
    let server_permanent = PermanentKeypair::generate();
    let server_session = SessionKeypair::generate();
    let client_permanent = PermanentKeypair::generate();

    let nonce = Nonce::new(Cookie::random(), ClientId(0x00), ClientId(0x01), 12345);

    // Server side
    let sign_box =
        CryptoBox::new(server_permanent.secret(), &client_permanent.public_key()).unwrap();
    let mut keys = Vec::with_capacity(2 * KEY_LENGTH);
    keys.extend_from_slice(&server_session.public_key_bytes());
    keys.extend_from_slice(&client_permanent.public_key_bytes());
    let signed_keys = sign_box.seal(&nonce.encode(), &keys).unwrap();

    // Client side
    let verify_box =
        CryptoBox::new(client_permanent.secret(), &server_permanent.public_key()).unwrap();
    let opened = verify_box.open(&nonce.encode(), &signed_keys).unwrap();

    assert_eq!(&opened[..KEY_LENGTH], &server_session.public_key_bytes());
    assert_eq!(&opened[KEY_LENGTH..], &client_permanent.public_key_bytes());

    // A different permanent key cannot forge the proof
    let impostor = PermanentKeypair::generate();
    let impostor_box =
        CryptoBox::new(client_permanent.secret(), &impostor.public_key()).unwrap();
    assert!(matches!(
        impostor_box.open(&nonce.encode(), &signed_keys),
        Err(CryptoError::AuthFailure)
    ));
}

/// Replayed envelopes are rejected by the validator before decryption is
/// even attempted, and a tampered envelope header breaks the AEAD binding.
#[test]
fn test_header_binding_and_replay() {
    let client = SessionKeypair::generate();
    let server = SessionKeypair::generate();

    let client_box = CryptoBox::new(client.secret(), &server.public_key()).unwrap();
    let server_box = CryptoBox::new(server.secret(), &client.public_key()).unwrap();

    let cookie = Cookie::random();
    let nonce = Nonce::new(cookie, ClientId(0x01), ClientId(0x00), 77);
    let sealed = client_box.seal(&nonce.encode(), b"ping").unwrap();

    let mut validator = NonceValidator::new(None);
    validator
        .check_and_record(&nonce.cookie, nonce.combined_sequence())
        .unwrap();
    assert!(server_box.open(&nonce.encode(), &sealed).is_ok());

    // Replay: same combined sequence number
    assert!(validator
        .check_and_record(&nonce.cookie, nonce.combined_sequence())
        .is_err());

    // Header tamper: bump the sequence without resealing
    let tampered = Nonce::new(cookie, ClientId(0x01), ClientId(0x00), 78);
    assert!(matches!(
        server_box.open(&tampered.encode(), &sealed),
        Err(CryptoError::AuthFailure)
    ));
}
