//! Proxy-protocol round trips as a connection would see them: sniff,
//! delimit, parse.

#[cfg(test)]
mod test {
    use protocol::proxy_header::{
        gen_binary_header, gen_text_header, parse_binary_header, parse_text_header,
        pre_parse_header, PeerAddr, PreParse,
    };

    #[test]
    fn text_header_end_to_end() {
        let client = "1.2.3.4:5678".parse().unwrap();
        let server = "10.0.0.1:3306".parse().unwrap();

        let header = gen_text_header(client, server).unwrap();
        assert_eq!(header, "PROXY TCP4 1.2.3.4 10.0.0.1 5678 3306\r\n");

        // A connection buffer may carry the first protocol bytes already;
        // pre-parse delimits the header inside it.
        let mut buffer = header.clone().into_bytes();
        buffer.extend_from_slice(&[0x20, 0x00, 0x00, 0x00]);

        let PreParse::Text(len) = pre_parse_header(&buffer).unwrap() else {
            panic!("expected a text header");
        };
        assert_eq!(len, header.len());

        let info = parse_text_header(&buffer[..len]).unwrap();
        assert!(info.is_proxy);
        assert_eq!(info.peer, Some(PeerAddr::Inet(client)));
    }

    #[test]
    fn binary_header_end_to_end() {
        for (client, server) in [
            ("1.2.3.4:5678", "10.0.0.1:3306"),
            ("[2001:db8::7]:5678", "[::1]:3306"),
        ] {
            let client = PeerAddr::Inet(client.parse().unwrap());
            let server = PeerAddr::Inet(server.parse().unwrap());

            let mut buffer = gen_binary_header(&client, &server);
            let header_len = buffer.len();
            buffer.extend_from_slice(&[0x20, 0x00, 0x00, 0x00]);

            let PreParse::Binary(len) = pre_parse_header(&buffer).unwrap() else {
                panic!("expected a binary header");
            };
            assert_eq!(len, header_len);

            let info = parse_binary_header(&buffer[..len]).unwrap();
            assert!(info.is_proxy);
            assert_eq!(info.peer, Some(client));
        }
    }

    #[test]
    fn unix_binary_header_round_trips() {
        let client = PeerAddr::Unix("/run/mysqld/mysqld.sock".to_string());
        let server = PeerAddr::Unix("/run/proxy.sock".to_string());

        let header = gen_binary_header(&client, &server);
        let info = parse_binary_header(&header).unwrap();
        assert_eq!(info.peer, Some(client));
    }

    #[test]
    fn non_proxy_preamble_fails_closed() {
        // The first bytes of a MySQL handshake are not a proxy header;
        // the listener must treat the peer as a direct client or drop it,
        // never guess.
        assert!(pre_parse_header(b"J\x00\x00\x00\x0a11.4.2-MariaDB").is_err());
    }
}
