//! Tests for CREDENTIAL frame bounds

use assert_matches::assert_matches;
use spdy_mux::{Credential, Frame, FrameError};

use super::{contexts, round_trip};

fn credential_bytes(slot: u16, proof: &[u8], certs: &[&[u8]]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&slot.to_be_bytes());
    body.extend_from_slice(&(proof.len() as u32).to_be_bytes());
    body.extend_from_slice(proof);
    for cert in certs {
        body.extend_from_slice(&(cert.len() as u32).to_be_bytes());
        body.extend_from_slice(cert);
    }
    let mut bytes = vec![0x80, 3, 0, 10, 0];
    let len = body.len() as u32;
    bytes.extend_from_slice(&len.to_be_bytes()[1..]);
    bytes.extend_from_slice(&body);
    bytes
}

fn parse(bytes: &[u8]) -> Result<Frame, FrameError> {
    let (_, mut decompressor) = contexts();
    Frame::parse(bytes, &mut decompressor)
}

#[test]
fn test_credential_fields() {
    let bytes = credential_bytes(2, b"proof", &[b"cert-a", b"cert-b"]);
    let frame = parse(&bytes).unwrap();
    assert_eq!(
        frame,
        Frame::Credential(Credential {
            slot: 2,
            proof: b"proof".to_vec(),
            certificates: vec![b"cert-a".to_vec(), b"cert-b".to_vec()],
        })
    );
}

#[test]
fn test_credential_without_certificates() {
    let frame = Frame::Credential(Credential {
        slot: 1,
        proof: vec![9; 16],
        certificates: Vec::new(),
    });
    assert_eq!(round_trip(&frame), frame);
}

#[test]
fn test_proof_length_past_end() {
    let mut bytes = credential_bytes(1, b"abcd", &[]);
    // Claim a 5-byte proof with only 4 bytes present
    bytes[13] = 5;
    assert_matches!(parse(&bytes), Err(FrameError::LengthMismatch { .. }));
}

#[test]
fn test_certificate_length_past_end() {
    let mut bytes = credential_bytes(1, b"", &[b"xyz"]);
    let last_len = bytes.len() - 4;
    bytes[last_len] = 4; // cert length 3 -> 4
    assert_matches!(parse(&bytes), Err(FrameError::LengthMismatch { .. }));
}

#[test]
fn test_truncated_certificate_length_field() {
    let mut bytes = credential_bytes(1, b"", &[]);
    bytes.extend_from_slice(&[0, 0]);
    bytes[7] += 2;
    assert_matches!(parse(&bytes), Err(FrameError::LengthMismatch { .. }));
}
