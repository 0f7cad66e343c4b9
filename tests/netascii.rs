use smol_tftpd::packet;

/// Assert that multiple nul bytes fails netascii validation.
#[test]
fn test_multiple_nul() {
    assert!(packet::netascii_from_u8("abc\0def\0".as_bytes()).is_err());
}

#[test]
fn trailing_nul_is_dropped() {
    assert_eq!(packet::netascii_from_u8(b"octet\0").unwrap(), "octet");
}

#[test]
fn bare_carriage_return() {
    assert!(packet::netascii_from_u8(b"a\rb").is_err());
    assert_eq!(packet::netascii_from_u8(b"a\r\nb").unwrap(), "a\r\nb");
    assert!(packet::netascii_from_u8(b"a\r").is_err());
}

#[test]
fn high_bytes_are_refused() {
    assert!(packet::netascii_from_u8("caf\u{e9}".as_bytes()).is_err());
}
