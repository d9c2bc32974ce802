//! Binary raw client over an in-memory duplex channel.
//!
//! Each test stages the server's response bytes on the far end of the
//! channel before issuing the call, then inspects both the decoded result
//! and the exact request bytes the client put on the wire.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

use shoal::{Disposition, Error, Item, ParseError, RawBinaryClient, ResponseStatus};
use shoal_protocol::Opcode;
use shoal_protocol::binary::{self, HEADER_SIZE, RESPONSE_MAGIC};

/// Build one server response frame.
fn response_frame(
    opcode: u8,
    status: u16,
    extras: &[u8],
    key: &[u8],
    value: &[u8],
    cas: u64,
) -> Vec<u8> {
    let total = extras.len() + key.len() + value.len();
    let mut data = Vec::with_capacity(HEADER_SIZE + total);
    data.push(RESPONSE_MAGIC);
    data.push(opcode);
    data.extend_from_slice(&(key.len() as u16).to_be_bytes());
    data.push(extras.len() as u8);
    data.push(0);
    data.extend_from_slice(&status.to_be_bytes());
    data.extend_from_slice(&(total as u32).to_be_bytes());
    data.extend_from_slice(&0u32.to_be_bytes());
    data.extend_from_slice(&cas.to_be_bytes());
    data.extend_from_slice(extras);
    data.extend_from_slice(key);
    data.extend_from_slice(value);
    data
}

fn request_frame(opcode: Opcode, cas: u64, key: &[u8], value: &[u8], extras: &[u8]) -> BytesMut {
    let mut buf = BytesMut::new();
    binary::encode_request(&mut buf, opcode, cas, key, value, extras);
    buf
}

async fn read_sent(server: &mut tokio::io::DuplexStream, len: usize) -> Vec<u8> {
    let mut sent = vec![0u8; len];
    server.read_exact(&mut sent).await.unwrap();
    sent
}

#[tokio::test]
async fn add_serializes_documented_frame() {
    let (conn, mut server) = duplex(1 << 20);
    let mut client = RawBinaryClient::new(0, conn);

    server
        .write_all(&response_frame(0x02, 0, &[], b"", b"", 1))
        .await
        .unwrap();

    let item = Item {
        key: "Hello".into(),
        value: Bytes::from_static(b"World"),
        flags: 0xdeadbeef,
        data_version_id: 0xdecafbad,
        expiration: 0xe10,
    };
    let resp = client.add(&item).await;
    assert!(resp.error().is_none());

    // 24-byte header + 8-byte extras + 5-byte key + 5-byte value.
    let sent = read_sent(&mut server, 42).await;
    #[rustfmt::skip]
    let expected: &[u8] = &[
        0x80,                   // magic
        0x02,                   // opcode: add
        0x00, 0x05,             // key length
        0x08,                   // extras length
        0x00,                   // data type
        0x00, 0x00,             // vbucket id
        0x00, 0x00, 0x00, 0x12, // total body length
        0x00, 0x00, 0x00, 0x00, // opaque
        0x00, 0x00, 0x00, 0x00, 0xde, 0xca, 0xfb, 0xad, // cas
        0xde, 0xad, 0xbe, 0xef, // flags
        0x00, 0x00, 0x0e, 0x10, // expiry
        b'H', b'e', b'l', b'l', b'o',
        b'W', b'o', b'r', b'l', b'd',
    ];
    assert_eq!(&sent[..], expected);
}

#[tokio::test]
async fn get_decodes_hit() {
    let (conn, mut server) = duplex(1 << 20);
    let mut client = RawBinaryClient::new(0, conn);

    server
        .write_all(&response_frame(
            0x00,
            0,
            &0xdeadbeefu32.to_be_bytes(),
            b"",
            b"World",
            42,
        ))
        .await
        .unwrap();

    let resp = client.get("Hello").await;
    assert!(resp.found());
    assert_eq!(resp.value().as_ref(), b"World");
    assert_eq!(resp.flags(), 0xdeadbeef);
    assert_eq!(resp.data_version_id(), 42);
    assert!(client.is_valid_state());

    let sent = read_sent(&mut server, HEADER_SIZE + 5).await;
    assert_eq!(&sent[..], &request_frame(Opcode::Get, 0, b"Hello", b"", &[])[..]);
}

#[tokio::test]
async fn get_miss_is_not_an_error() {
    let (conn, mut server) = duplex(1 << 20);
    let mut client = RawBinaryClient::new(0, conn);

    server
        .write_all(&response_frame(0x00, 0x0001, &[], b"", b"", 0))
        .await
        .unwrap();

    let resp = client.get("nope").await;
    assert_eq!(resp.status(), ResponseStatus::KeyNotFound);
    assert!(resp.error().is_none());
    assert!(!resp.found());
    assert!(client.is_valid_state());
}

#[tokio::test]
async fn cas_mismatch_reports_key_exists() {
    let (conn, mut server) = duplex(1 << 20);
    let mut client = RawBinaryClient::new(0, conn);

    server
        .write_all(&response_frame(0x01, 0x0002, &[], b"", b"", 0))
        .await
        .unwrap();

    let mut item = Item::new("k", "v");
    item.data_version_id = 5;
    let resp = client.set(&item).await;
    assert_eq!(resp.status(), ResponseStatus::KeyExists);
    assert!(matches!(
        resp.error(),
        Some(Error::Status(ResponseStatus::KeyExists))
    ));
    // A status error does not poison the connection.
    assert!(client.is_valid_state());

    // The CAS travels in header bytes 16..24.
    let sent = read_sent(&mut server, HEADER_SIZE + 8 + 1 + 1).await;
    assert_eq!(&sent[16..24], &5u64.to_be_bytes());
}

#[tokio::test]
async fn set_reports_new_version() {
    let (conn, mut server) = duplex(1 << 20);
    let mut client = RawBinaryClient::new(0, conn);

    server
        .write_all(&response_frame(0x01, 0, &[], b"", b"", 99))
        .await
        .unwrap();

    let resp = client.set(&Item::new("k", "v")).await;
    assert!(resp.error().is_none());
    assert_eq!(resp.data_version_id(), 99);
}

#[tokio::test]
async fn bad_magic_poisons_connection() {
    let (conn, mut server) = duplex(1 << 20);
    let mut client = RawBinaryClient::new(0, conn);

    let mut frame = response_frame(0x00, 0, &[], b"", b"", 0);
    frame[0] = 0x42;
    server.write_all(&frame).await.unwrap();

    let resp = client.get("k").await;
    assert!(matches!(
        resp.error(),
        Some(Error::Protocol(ParseError::BadMagic(0x42)))
    ));
    assert!(!client.is_valid_state());

    // Subsequent calls fail without touching the wire.
    let resp = client.get("k").await;
    assert!(matches!(resp.error(), Some(Error::InvalidState)));

    assert!(matches!(client.finish(), Disposition::Discard(_)));
}

#[tokio::test]
async fn opcode_echo_mismatch_poisons_connection() {
    let (conn, mut server) = duplex(1 << 20);
    let mut client = RawBinaryClient::new(0, conn);

    // The client sent a get; the server answers with a set opcode.
    server
        .write_all(&response_frame(0x01, 0, &[], b"", b"", 0))
        .await
        .unwrap();

    let resp = client.get("k").await;
    assert!(matches!(
        resp.error(),
        Some(Error::Protocol(ParseError::UnexpectedOpcode { .. }))
    ));
    assert!(!client.is_valid_state());
}

#[tokio::test]
async fn healthy_client_finishes_as_reuse() {
    let (conn, mut server) = duplex(1 << 20);
    let mut client = RawBinaryClient::new(0, conn);

    server
        .write_all(&response_frame(0x00, 0x0001, &[], b"", b"", 0))
        .await
        .unwrap();
    client.get("k").await;

    assert!(client.is_valid_state());
    assert!(matches!(client.finish(), Disposition::Reuse(_)));
}

#[tokio::test]
async fn get_multi_dedups_and_pipelines() {
    let (conn, mut server) = duplex(1 << 20);
    let mut client = RawBinaryClient::new(0, conn);

    let mut replies = Vec::new();
    replies.extend_from_slice(&response_frame(
        0x00,
        0,
        &0u32.to_be_bytes(),
        b"",
        b"va",
        1,
    ));
    replies.extend_from_slice(&response_frame(
        0x00,
        0,
        &0u32.to_be_bytes(),
        b"",
        b"vb",
        2,
    ));
    server.write_all(&replies).await.unwrap();

    let responses = client.get_multi(&["a", "a", "b"]).await;
    assert_eq!(responses.len(), 2);
    assert_eq!(responses["a"].value().as_ref(), b"va");
    assert_eq!(responses["b"].value().as_ref(), b"vb");

    // Exactly two requests were pipelined, in first-seen key order.
    let mut expected = BytesMut::new();
    expected.extend_from_slice(&request_frame(Opcode::Get, 0, b"a", b"", &[]));
    expected.extend_from_slice(&request_frame(Opcode::Get, 0, b"b", b"", &[]));
    let sent = read_sent(&mut server, expected.len()).await;
    assert_eq!(&sent[..], &expected[..]);
}

#[tokio::test]
async fn set_multi_pipelines_in_order() {
    let (conn, mut server) = duplex(1 << 20);
    let mut client = RawBinaryClient::new(0, conn);

    let mut replies = Vec::new();
    replies.extend_from_slice(&response_frame(0x01, 0, &[], b"", b"", 7));
    replies.extend_from_slice(&response_frame(0x01, 0, &[], b"", b"", 8));
    server.write_all(&replies).await.unwrap();

    let items = vec![Item::new("k1", "v1"), Item::new("k2", "v2")];
    let responses = client.set_multi(&items).await;
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0].key(), "k1");
    assert_eq!(responses[0].data_version_id(), 7);
    assert_eq!(responses[1].key(), "k2");
    assert_eq!(responses[1].data_version_id(), 8);

    let extras = binary::store_extras(0, 0);
    let mut expected = BytesMut::new();
    expected.extend_from_slice(&request_frame(Opcode::Set, 0, b"k1", b"v1", &extras));
    expected.extend_from_slice(&request_frame(Opcode::Set, 0, b"k2", b"v2", &extras));
    let sent = read_sent(&mut server, expected.len()).await;
    assert_eq!(&sent[..], &expected[..]);
}

#[tokio::test]
async fn batch_validation_failure_skips_only_that_item() {
    let (conn, mut server) = duplex(1 << 20);
    let mut client = RawBinaryClient::new(0, conn);

    server
        .write_all(&response_frame(0x01, 0, &[], b"", b"", 3))
        .await
        .unwrap();

    let items = vec![Item::new("bad key", "v"), Item::new("good", "v")];
    let responses = client.set_multi(&items).await;
    assert!(matches!(
        responses[0].error(),
        Some(Error::InvalidKey(_))
    ));
    assert!(responses[1].error().is_none());
    assert!(client.is_valid_state());

    // Only the valid item reached the wire.
    let extras = binary::store_extras(0, 0);
    let expected = request_frame(Opcode::Set, 0, b"good", b"v", &extras);
    let sent = read_sent(&mut server, expected.len()).await;
    assert_eq!(&sent[..], &expected[..]);
}

#[tokio::test]
async fn increment_decodes_counter() {
    let (conn, mut server) = duplex(1 << 20);
    let mut client = RawBinaryClient::new(0, conn);

    server
        .write_all(&response_frame(0x05, 0, &[], b"", &16u64.to_be_bytes(), 0))
        .await
        .unwrap();

    let resp = client.increment("ctr", 2, 100, 60).await;
    assert!(resp.error().is_none());
    assert_eq!(resp.count(), 16);

    let extras = binary::counter_extras(2, 100, 60);
    let expected = request_frame(Opcode::Increment, 0, b"ctr", b"", &extras);
    let sent = read_sent(&mut server, expected.len()).await;
    assert_eq!(&sent[..], &expected[..]);
}

#[tokio::test]
async fn increment_miss_with_sentinel_expiration() {
    let (conn, mut server) = duplex(1 << 20);
    let mut client = RawBinaryClient::new(0, conn);

    server
        .write_all(&response_frame(0x05, 0x0001, &[], b"", b"", 0))
        .await
        .unwrap();

    let resp = client.increment("ctr", 2, 0, 0xffffffff).await;
    assert_eq!(resp.status(), ResponseStatus::KeyNotFound);
    assert_eq!(resp.count(), 0);
    assert!(client.is_valid_state());
}

#[tokio::test]
async fn oversized_value_rejected_before_io() {
    let (conn, _server) = duplex(1 << 20);
    let mut client = RawBinaryClient::new(0, conn);

    let item = Item::new("k", vec![0u8; 1024 * 1024 + 1]);
    let resp = client.set(&item).await;
    assert!(matches!(resp.error(), Some(Error::ValueTooLarge(_))));
    assert!(client.is_valid_state());
}

#[tokio::test]
async fn stat_collects_until_terminator() {
    let (conn, mut server) = duplex(1 << 20);
    let mut client = RawBinaryClient::new(7, conn);

    let mut replies = Vec::new();
    replies.extend_from_slice(&response_frame(0x10, 0, &[], b"uptime", b"1234", 0));
    replies.extend_from_slice(&response_frame(0x10, 0, &[], b"version", b"1.6.21", 0));
    replies.extend_from_slice(&response_frame(0x10, 0, &[], b"", b"", 0));
    server.write_all(&replies).await.unwrap();

    let resp = client.stat("").await;
    assert!(resp.error().is_none());
    let entries = &resp.entries()[&7];
    assert_eq!(entries["uptime"], "1234");
    assert_eq!(entries["version"], "1.6.21");
    assert!(client.is_valid_state());
}

#[tokio::test]
async fn stat_error_status_poisons_connection() {
    let (conn, mut server) = duplex(1 << 20);
    let mut client = RawBinaryClient::new(0, conn);

    server
        .write_all(&response_frame(0x10, 0x0084, &[], b"", b"", 0))
        .await
        .unwrap();

    let resp = client.stat("").await;
    assert_eq!(resp.status(), ResponseStatus::InternalError);
    assert!(!client.is_valid_state());
}

#[tokio::test]
async fn version_keyed_by_shard_id() {
    let (conn, mut server) = duplex(1 << 20);
    let mut client = RawBinaryClient::new(3, conn);

    server
        .write_all(&response_frame(0x0b, 0, &[], b"", b"1.6.21", 0))
        .await
        .unwrap();

    let resp = client.version().await;
    assert!(resp.error().is_none());
    assert_eq!(resp.versions()[&3], "1.6.21");
}

#[tokio::test]
async fn flush_round_trip() {
    let (conn, mut server) = duplex(1 << 20);
    let mut client = RawBinaryClient::new(0, conn);

    server
        .write_all(&response_frame(0x08, 0, &[], b"", b"", 0))
        .await
        .unwrap();

    let resp = client.flush(30).await;
    assert!(resp.error().is_none());

    let expected = request_frame(Opcode::Flush, 0, b"", b"", &binary::u32_extras(30));
    let sent = read_sent(&mut server, expected.len()).await;
    assert_eq!(&sent[..], &expected[..]);
}

#[tokio::test]
async fn transport_error_poisons_connection() {
    let (conn, server) = duplex(1 << 20);
    let mut client = RawBinaryClient::new(0, conn);

    // Server goes away without answering.
    drop(server);

    let resp = client.get("k").await;
    assert!(matches!(resp.error(), Some(Error::Io(_))));
    assert!(!client.is_valid_state());
    assert!(matches!(client.finish(), Disposition::Discard(_)));
}
