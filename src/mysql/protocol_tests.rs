// MySQL protocol unit tests
// Byte layouts are checked against what stock MySQL clients send and expect.

#[cfg(test)]
mod tests {
    use super::super::packet::*;
    use super::super::protocol::*;
    use crate::error::{FrontendError, SqlError};
    use crate::expression::charset::UTF8MB4_GENERAL_CI_ID;
    use bytes::{BufMut, BytesMut};

    const SALT: [u8; 20] = *b"abcdefghijklmnopqrst";

    fn response_41(capability: u32, body: impl FnOnce(&mut BytesMut)) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u32_le(capability);
        buf.put_u32_le(16 << 20);
        buf.put_u8(46);
        buf.put_slice(&[0u8; 23]);
        body(&mut buf);
        buf.to_vec()
    }

    fn parse(data: &[u8]) -> crate::error::Result<HandshakeResponse> {
        let (mut resp, offset) = HandshakeResponse::parse_header(data)?;
        resp.parse_body(data, offset)?;
        Ok(resp)
    }

    /// Column type codes must match the wire values.
    #[test]
    fn test_column_type_codes() {
        assert_eq!(ColumnType::Decimal as u8, 0x00);
        assert_eq!(ColumnType::Long as u8, 0x03);
        assert_eq!(ColumnType::LongLong as u8, 0x08);
        assert_eq!(ColumnType::DateTime as u8, 0x0c);
        assert_eq!(ColumnType::VarChar as u8, 0x0f);
        assert_eq!(ColumnType::NewDecimal as u8, 0xf6);
        assert_eq!(ColumnType::VarString as u8, 0xfd);
        assert_eq!(ColumnType::from_u8(0xfe), Some(ColumnType::String));
        assert_eq!(ColumnType::from_u8(0x11), None);
    }

    #[test]
    fn test_command_codes_round_trip() {
        for code in 0u8..=0x1f {
            assert_eq!(Command::from(code).code(), code);
        }
        assert_eq!(Command::from(0x03), Command::Query);
        assert_eq!(Command::from(0x1c), Command::StmtFetch);
        assert_eq!(Command::from(0x42), Command::Unknown(0x42));
    }

    /// Capability flags advertised in the greeting
    #[test]
    fn test_capability_flags() {
        let caps = server_capabilities(false);
        assert!(caps & CLIENT_PROTOCOL_41 != 0);
        assert!(caps & CLIENT_SECURE_CONNECTION != 0);
        assert!(caps & CLIENT_PLUGIN_AUTH != 0);
        assert!(caps & CLIENT_MULTI_STATEMENTS != 0);
        assert!(caps & CLIENT_CONNECT_ATTRS != 0);
        assert_eq!(caps & CLIENT_SSL, 0, "SSL is only offered with a certificate");
        assert_eq!(caps & CLIENT_DEPRECATE_EOF, 0, "result sets always end with EOF");
        assert!(server_capabilities(true) & CLIENT_SSL != 0);
    }

    /// Greeting layout: version 10, NUL-terminated server version, salt split 8 + 12.
    #[test]
    fn test_handshake_packet_layout() {
        let packet = HandshakePacket {
            server_version: "8.0.11-sqlfe".to_string(),
            connection_id: 1090,
            salt: SALT,
            capability_flags: server_capabilities(false),
            collation: 46,
            status_flags: SERVER_STATUS_AUTOCOMMIT,
            auth_plugin_name: "mysql_native_password".to_string(),
        };
        let buf = packet.encode();

        assert_eq!(buf[0], PROTOCOL_VERSION);
        let version_end = 1 + "8.0.11-sqlfe".len();
        assert_eq!(&buf[1..version_end], b"8.0.11-sqlfe");
        assert_eq!(buf[version_end], 0);

        let mut r = PayloadReader::new(&buf[version_end + 1..]);
        assert_eq!(r.u32_le().unwrap(), 1090);
        assert_eq!(r.bytes(8).unwrap(), &SALT[..8]);
        assert_eq!(r.u8().unwrap(), 0, "filler");
        let cap_low = r.u16_le().unwrap() as u32;
        assert_eq!(r.u8().unwrap(), 46);
        assert_eq!(r.u16_le().unwrap(), SERVER_STATUS_AUTOCOMMIT);
        let cap_high = r.u16_le().unwrap() as u32;
        assert_eq!(cap_low | (cap_high << 16), server_capabilities(false));
        assert_eq!(r.u8().unwrap(), 21, "auth data length includes the trailing NUL");
        assert_eq!(r.bytes(10).unwrap(), &[0u8; 10]);
        assert_eq!(r.bytes(12).unwrap(), &SALT[8..]);
        assert_eq!(r.u8().unwrap(), 0);
        assert_eq!(r.null_terminated().unwrap(), b"mysql_native_password");
        assert!(r.is_empty());
    }

    #[test]
    fn test_handshake_response_41() {
        let caps = CLIENT_PROTOCOL_41
            | CLIENT_SECURE_CONNECTION
            | CLIENT_CONNECT_WITH_DB
            | CLIENT_PLUGIN_AUTH
            | CLIENT_CONNECT_ATTRS;
        let data = response_41(caps, |buf| {
            buf.put_slice(b"root\0");
            buf.put_u8(20);
            buf.put_slice(&[7u8; 20]);
            buf.put_slice(b"test\0");
            buf.put_slice(b"mysql_native_password\0");
            let mut attrs = BytesMut::new();
            write_lenenc_str(&mut attrs, "_client_name");
            write_lenenc_str(&mut attrs, "libmysql");
            write_lenenc_bytes(buf, &attrs);
        });

        let resp = parse(&data).unwrap();
        assert!(!resp.legacy);
        assert_eq!(resp.capability, caps);
        assert_eq!(resp.collation, 46);
        assert_eq!(resp.user, "root");
        assert_eq!(resp.auth, vec![7u8; 20]);
        assert_eq!(resp.db, "test");
        assert_eq!(resp.auth_plugin, "mysql_native_password");
        assert_eq!(resp.attrs.get("_client_name").map(String::as_str), Some("libmysql"));
    }

    #[test]
    fn test_handshake_response_lenenc_auth() {
        let caps = CLIENT_PROTOCOL_41 | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA | CLIENT_SECURE_CONNECTION;
        let data = response_41(caps, |buf| {
            buf.put_slice(b"app\0");
            write_lenenc_bytes(buf, b"secret-bytes");
        });
        let resp = parse(&data).unwrap();
        assert_eq!(resp.user, "app");
        assert_eq!(resp.auth, b"secret-bytes");
    }

    /// Some drivers set the lenenc bit and send 0x01 for "no auth data".
    #[test]
    fn test_handshake_response_lenenc_quirk() {
        let caps = CLIENT_PROTOCOL_41 | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA | CLIENT_CONNECT_WITH_DB;
        let data = response_41(caps, |buf| {
            buf.put_slice(b"app\0");
            buf.put_slice(&[0x01, 0x00]);
            buf.put_slice(b"shop\0");
        });
        let resp = parse(&data).unwrap();
        assert!(resp.auth.is_empty());
        assert_eq!(resp.db, "shop");
    }

    #[test]
    fn test_handshake_response_null_terminated_auth() {
        let data = response_41(CLIENT_PROTOCOL_41, |buf| {
            buf.put_slice(b"u\0");
            buf.put_slice(b"pw\0");
        });
        let resp = parse(&data).unwrap();
        assert_eq!(resp.auth, b"pw");
    }

    #[test]
    fn test_bad_attrs_are_ignored() {
        let caps = CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION | CLIENT_CONNECT_ATTRS;
        let data = response_41(caps, |buf| {
            buf.put_slice(b"root\0");
            buf.put_u8(0);
            // block claims a 10-byte key but holds only 2 bytes
            write_lenenc_bytes(buf, &[10, b'a']);
        });
        let resp = parse(&data).unwrap();
        assert_eq!(resp.user, "root");
        assert!(resp.attrs.is_empty());
    }

    #[test]
    fn test_handshake_response_320() {
        let mut buf = BytesMut::new();
        buf.put_u16_le((CLIENT_CONNECT_WITH_DB | CLIENT_LONG_PASSWORD) as u16);
        buf.put_uint_le(0xffffff, 3);
        buf.put_slice(b"old\0");
        buf.put_slice(b"db1\0");
        buf.put_slice(b"scramble\0");

        let resp = parse(&buf).unwrap();
        assert!(resp.legacy);
        assert!(resp.capability & CLIENT_PROTOCOL_41 != 0);
        assert_eq!(resp.collation, UTF8MB4_GENERAL_CI_ID);
        assert_eq!(resp.max_packet_size, 0xffffff);
        assert_eq!(resp.user, "old");
        assert_eq!(resp.db, "db1");
        assert_eq!(resp.auth, b"scramble");
    }

    #[test]
    fn test_handshake_response_320_missing_nul() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(CLIENT_LONG_PASSWORD as u16);
        buf.put_uint_le(0xffffff, 3);
        buf.put_slice(b"old");
        assert!(matches!(parse(&buf), Err(FrontendError::Malformed(_))));
    }

    #[test]
    fn test_truncated_response_is_malformed() {
        assert!(matches!(
            HandshakeResponse::parse_header(&[0x00]),
            Err(FrontendError::Malformed(_))
        ));
        let short = (CLIENT_PROTOCOL_41 as u16).to_le_bytes();
        assert!(matches!(
            HandshakeResponse::parse_header(&short),
            Err(FrontendError::Malformed(_))
        ));
    }

    /// An SSLRequest is only the 32-byte header; the body follows after TLS.
    #[test]
    fn test_ssl_request_then_reparse() {
        let caps = CLIENT_PROTOCOL_41 | CLIENT_SSL | CLIENT_SECURE_CONNECTION;
        let ssl_request = response_41(caps, |_| {});
        let (first, offset) = HandshakeResponse::parse_header(&ssl_request).unwrap();
        assert_eq!(offset, ssl_request.len());
        assert!(first.capability & CLIENT_SSL != 0);

        let full = response_41(caps, |buf| {
            buf.put_slice(b"secure\0");
            buf.put_u8(0);
        });
        let (mut resp, offset) = first.reparse_header(&full).unwrap();
        resp.parse_body(&full, offset).unwrap();
        assert_eq!(resp.user, "secure");
    }

    #[test]
    fn test_ok_packet() {
        let ok = OkPacket {
            affected_rows: 3,
            last_insert_id: 300,
            status_flags: SERVER_STATUS_AUTOCOMMIT,
            warnings: 1,
            info: String::new(),
        };
        let buf = ok.encode(CLIENT_PROTOCOL_41);
        assert_eq!(&buf[..], &[0x00, 3, 0xfc, 0x2c, 0x01, 0x02, 0x00, 0x01, 0x00]);

        let pre41 = ok.encode(0);
        assert_eq!(&pre41[..], &[0x00, 3, 0xfc, 0x2c, 0x01]);
    }

    /// The handshake OK: header, zero rows and id, autocommit, no warnings.
    #[test]
    fn test_handshake_ok_bytes() {
        let ok = OkPacket {
            status_flags: SERVER_STATUS_AUTOCOMMIT,
            ..Default::default()
        };
        assert_eq!(&ok.encode(CLIENT_PROTOCOL_41)[..], &[0, 0, 0, 2, 0, 0, 0]);
    }

    #[test]
    fn test_err_packet() {
        let err = FrontendError::AccessDenied {
            user: "root".to_string(),
            host: "127.0.0.1".to_string(),
            using_password: true,
        }
        .to_sql_error();
        let buf = ErrPacket::new(&err).encode(CLIENT_PROTOCOL_41);
        assert_eq!(buf[0], ERR_HEADER);
        assert_eq!(u16::from_le_bytes([buf[1], buf[2]]), 1045);
        assert_eq!(&buf[3..9], b"#28000");
        assert_eq!(
            &buf[9..],
            b"Access denied for user 'root'@'127.0.0.1' (using password: YES)"
        );

        let before_handshake = ErrPacket::new(&err).encode(0);
        assert_eq!(&before_handshake[3..9], b"Access");
    }

    #[test]
    fn test_eof_packet() {
        let eof = EofPacket {
            warnings: 2,
            status_flags: SERVER_STATUS_AUTOCOMMIT | SERVER_MORE_RESULTS_EXISTS,
        };
        assert_eq!(&eof.encode(CLIENT_PROTOCOL_41)[..], &[0xfe, 2, 0, 0x0a, 0]);
        assert_eq!(&eof.encode(0)[..], &[0xfe]);
    }

    #[test]
    fn test_auth_switch_request() {
        let buf = auth_switch_request("caching_sha2_password", &SALT);
        let mut r = PayloadReader::new(&buf);
        assert_eq!(r.u8().unwrap(), AUTH_SWITCH_HEADER);
        assert_eq!(r.null_terminated().unwrap(), b"caching_sha2_password");
        assert_eq!(r.bytes(20).unwrap(), &SALT);
        assert_eq!(r.u8().unwrap(), 0);
        assert!(r.is_empty());
    }

    #[test]
    fn test_column_definition() {
        let mut def = ColumnDefinition::new("id", ColumnType::LongLong)
            .with_table("test", "t")
            .with_flags(NOT_NULL_FLAG | PRI_KEY_FLAG);
        let buf = def.encode();
        let mut r = PayloadReader::new(&buf);
        assert_eq!(r.lenenc_bytes().unwrap(), b"def");
        assert_eq!(r.lenenc_bytes().unwrap(), b"test");
        assert_eq!(r.lenenc_bytes().unwrap(), b"t");
        assert_eq!(r.lenenc_bytes().unwrap(), b"t");
        assert_eq!(r.lenenc_bytes().unwrap(), b"id");
        assert_eq!(r.lenenc_bytes().unwrap(), b"id");
        assert_eq!(r.lenenc_int().unwrap(), Some(0x0c));
        assert_eq!(r.u16_le().unwrap(), 63);
        assert_eq!(r.u32_le().unwrap(), 20);
        assert_eq!(r.u8().unwrap(), ColumnType::LongLong as u8);
        assert_eq!(r.u16_le().unwrap(), BINARY_FLAG | NOT_NULL_FLAG | PRI_KEY_FLAG);
        assert_eq!(r.u8().unwrap(), 0);
        assert_eq!(r.u16_le().unwrap(), 0);
        assert!(r.is_empty());

        // COM_FIELD_LIST appends a default value
        def.default_value = Some(Vec::new());
        let with_default = def.encode();
        assert_eq!(with_default.len(), buf.len() + 1);
        assert_eq!(with_default[with_default.len() - 1], 0);
    }

    #[test]
    fn test_prepare_ok() {
        let ok = StmtPrepareOk {
            statement_id: 5,
            num_columns: 2,
            num_params: 1,
            warnings: 0,
        };
        assert_eq!(&ok.encode()[..], &[0, 5, 0, 0, 0, 2, 0, 1, 0, 0, 0, 0]);
    }

    #[test]
    fn test_lenenc_int_boundaries() {
        for value in [0u64, 250, 251, 0xffff, 0x10000, 0xffffff, 0x1000000, u64::MAX] {
            let mut buf = BytesMut::new();
            write_lenenc_int(&mut buf, value);
            let mut r = PayloadReader::new(&buf);
            assert_eq!(r.lenenc_int().unwrap(), Some(value));
            assert!(r.is_empty());
        }
        assert_eq!(PayloadReader::new(&[0xfb]).lenenc_int().unwrap(), None);
    }

    #[test]
    fn test_reader_bounds() {
        let mut r = PayloadReader::new(&[1, 2, 3]);
        assert!(matches!(r.u32_le(), Err(FrontendError::Malformed(_))));
        assert_eq!(r.u16_le().unwrap(), 0x0201);
        assert_eq!(r.null_terminated_or_rest(), &[3]);
        assert!(r.is_empty());
    }

    #[test]
    fn test_sql_error_states() {
        let cases: Vec<(FrontendError, u16, &str)> = vec![
            (FrontendError::PacketTooLarge, 1153, "08S01"),
            (FrontendError::SecureTransportRequired, 3159, "HY000"),
            (FrontendError::MultiStatementDisabled, 8130, "HY000"),
            (FrontendError::QueryInterrupted, 1317, "70100"),
            (FrontendError::TooManyConnections, 1040, "08004"),
            (FrontendError::UnknownCommand(0x42), 1105, "HY000"),
            (FrontendError::CursorNotExist(1), 1421, "HY000"),
            (FrontendError::UnknownStmtHandler(9, "stmt_execute"), 1243, "HY000"),
            (FrontendError::UnknownAuthPlugin("x".to_string()), 1251, "08004"),
        ];
        for (err, code, state) in cases {
            let SqlError { code: c, state: s, .. } = err.to_sql_error();
            assert_eq!((c, s.as_str()), (code, state), "{}", err);
        }
    }
}
