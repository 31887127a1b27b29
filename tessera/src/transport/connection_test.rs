//! Tests driving a real `Connection` against an in-process mock server
//! speaking just enough of the protocol.

use crate::statement::prepared_statement::PreparedStatement;
use crate::statement::query::Query;
use crate::statement::Consistency;
use crate::transport::connection::{open_connection, ConnectionConfig};
use crate::transport::iterator::RowIterator;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use tessera_cql::frame::response::result::PreparedMetadata;
use tessera_cql::frame::value::SerializedValues;
use tessera_cql::frame::{types, ProtocolVersion};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const OPCODE_ERROR: u8 = 0x00;
const OPCODE_STARTUP: u8 = 0x01;
const OPCODE_READY: u8 = 0x02;
const OPCODE_OPTIONS: u8 = 0x05;
const OPCODE_SUPPORTED: u8 = 0x06;
const OPCODE_QUERY: u8 = 0x07;
const OPCODE_RESULT: u8 = 0x08;
const OPCODE_PREPARE: u8 = 0x09;
const OPCODE_EXECUTE: u8 = 0x0A;

struct MockFrame {
    stream: i16,
    opcode: u8,
    #[allow(dead_code)]
    body: Vec<u8>,
}

async fn read_frame(socket: &mut TcpStream) -> MockFrame {
    let mut header = [0u8; 9];
    socket.read_exact(&mut header).await.unwrap();
    assert_eq!(header[0] & 0x80, 0, "expected a client frame");

    let stream = i16::from_be_bytes([header[2], header[3]]);
    let opcode = header[4];
    let length = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;

    let mut body = vec![0u8; length];
    socket.read_exact(&mut body).await.unwrap();

    MockFrame {
        stream,
        opcode,
        body,
    }
}

async fn write_response(socket: &mut TcpStream, stream: i16, opcode: u8, body: &[u8]) {
    let mut frame = Vec::with_capacity(9 + body.len());
    frame.push(0x84);
    frame.push(0x00);
    frame.extend_from_slice(&stream.to_be_bytes());
    frame.push(opcode);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    socket.write_all(&frame).await.unwrap();
}

// OPTIONS/SUPPORTED and STARTUP/READY, as the driver performs them
// before the router starts.
async fn serve_handshake(socket: &mut TcpStream) {
    let options = read_frame(socket).await;
    assert_eq!(options.opcode, OPCODE_OPTIONS);
    let mut supported_body = Vec::new();
    types::write_string_multimap(&Default::default(), &mut supported_body).unwrap();
    write_response(socket, options.stream, OPCODE_SUPPORTED, &supported_body).await;

    let startup = read_frame(socket).await;
    assert_eq!(startup.opcode, OPCODE_STARTUP);
    write_response(socket, startup.stream, OPCODE_READY, &[]).await;
}

fn void_result_body() -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(0x0001, &mut body);
    body
}

// A Rows result with no columns; `rows_count` empty rows and an optional
// paging state for the next page.
fn rows_page_body(rows_count: i32, paging_state: Option<&[u8]>) -> Vec<u8> {
    const HAS_MORE_PAGES: i32 = 0x0002;
    const NO_METADATA: i32 = 0x0004;

    let mut body = Vec::new();
    types::write_int(0x0002, &mut body); // kind: Rows
    let mut flags = NO_METADATA;
    if paging_state.is_some() {
        flags |= HAS_MORE_PAGES;
    }
    types::write_int(flags, &mut body);
    types::write_int(0, &mut body); // col count
    if let Some(state) = paging_state {
        types::write_bytes(state, &mut body).unwrap();
    }
    types::write_int(rows_count, &mut body);
    body
}

fn unprepared_error_body(statement_id: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(0x2500, &mut body);
    types::write_string("unprepared", &mut body).unwrap();
    types::write_short_bytes(statement_id, &mut body).unwrap();
    body
}

fn prepared_result_body(statement_id: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(0x0004, &mut body); // kind: Prepared
    types::write_short_bytes(statement_id, &mut body).unwrap();
    types::write_int(0, &mut body); // prepared metadata flags
    types::write_int(0, &mut body); // col count
    types::write_int(0, &mut body); // pk count
    types::write_int(0, &mut body); // result metadata flags
    types::write_int(0, &mut body); // result metadata col count
    body
}

fn test_connection_config() -> ConnectionConfig {
    ConnectionConfig {
        protocol_version: Some(ProtocolVersion::V4),
        keepalive_interval: None,
        ..Default::default()
    }
}

fn fake_prepared(statement_id: &'static [u8]) -> PreparedStatement {
    PreparedStatement::new(
        Bytes::from_static(statement_id),
        None,
        PreparedMetadata {
            flags: 0,
            col_count: 0,
            pk_indexes: Vec::new(),
            col_specs: Vec::new(),
        },
        "INSERT INTO ks.t (a) VALUES (?)".to_string(),
        None,
        Default::default(),
    )
}

#[tokio::test]
async fn handshake_and_simple_query() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        serve_handshake(&mut socket).await;

        let query = read_frame(&mut socket).await;
        assert_eq!(query.opcode, OPCODE_QUERY);
        write_response(&mut socket, query.stream, OPCODE_RESULT, &void_result_body()).await;
    });

    let (connection, _error_receiver) = open_connection(None, addr, test_connection_config())
        .await
        .unwrap();

    let result = connection
        .query_single_page("INSERT INTO ks.t (a) VALUES (1)", ())
        .await
        .unwrap();
    assert!(result.result_not_rows().is_ok());

    server.await.unwrap();
}

// UNPREPARED must trigger a re-prepare on the same connection followed by
// a retried EXECUTE; the caller must never see the UNPREPARED error.
#[tokio::test]
async fn unprepared_reprepares_on_the_same_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    const STATEMENT_ID: &[u8] = b"stmt_id_1";

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        serve_handshake(&mut socket).await;

        // First EXECUTE: the statement is not known here.
        let execute = read_frame(&mut socket).await;
        assert_eq!(execute.opcode, OPCODE_EXECUTE);
        write_response(
            &mut socket,
            execute.stream,
            OPCODE_ERROR,
            &unprepared_error_body(STATEMENT_ID),
        )
        .await;

        // The driver re-prepares in place.
        let prepare = read_frame(&mut socket).await;
        assert_eq!(prepare.opcode, OPCODE_PREPARE);
        write_response(
            &mut socket,
            prepare.stream,
            OPCODE_RESULT,
            &prepared_result_body(STATEMENT_ID),
        )
        .await;

        // The EXECUTE is retried and succeeds.
        let execute = read_frame(&mut socket).await;
        assert_eq!(execute.opcode, OPCODE_EXECUTE);
        write_response(&mut socket, execute.stream, OPCODE_RESULT, &void_result_body()).await;
    });

    let (connection, _error_receiver) = open_connection(None, addr, test_connection_config())
        .await
        .unwrap();

    let prepared = fake_prepared(STATEMENT_ID);
    let response = connection
        .execute_with_consistency(
            &prepared,
            SerializedValues::EMPTY,
            Consistency::Quorum,
            None,
            None,
        )
        .await
        .unwrap();

    let result = response.into_query_result().unwrap();
    assert!(result.result_not_rows().is_ok());

    server.await.unwrap();
}

// A failed re-preparation must be surfaced instead of looping.
#[tokio::test]
async fn failed_repreparation_is_surfaced() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    const STATEMENT_ID: &[u8] = b"stmt_id_2";

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        serve_handshake(&mut socket).await;

        let execute = read_frame(&mut socket).await;
        assert_eq!(execute.opcode, OPCODE_EXECUTE);
        write_response(
            &mut socket,
            execute.stream,
            OPCODE_ERROR,
            &unprepared_error_body(STATEMENT_ID),
        )
        .await;

        // The re-prepare fails with a syntax error.
        let prepare = read_frame(&mut socket).await;
        assert_eq!(prepare.opcode, OPCODE_PREPARE);
        let mut error_body = Vec::new();
        types::write_int(0x2000, &mut error_body);
        types::write_string("syntax error", &mut error_body).unwrap();
        write_response(&mut socket, prepare.stream, OPCODE_ERROR, &error_body).await;
    });

    let (connection, _error_receiver) = open_connection(None, addr, test_connection_config())
        .await
        .unwrap();

    let prepared = fake_prepared(STATEMENT_ID);
    let result = connection
        .execute_with_consistency(
            &prepared,
            SerializedValues::EMPTY,
            Consistency::Quorum,
            None,
            None,
        )
        .await;
    assert!(result.is_err());

    server.await.unwrap();
}

// For N rows with page size P, iterating to exhaustion issues exactly
// ceil(N/P) page requests and yields N rows in order.
#[tokio::test]
async fn iterator_pages_until_exhaustion() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        serve_handshake(&mut socket).await;

        // 12 rows, page size 5: pages of 5, 5 and 2.
        let pages: [(i32, Option<&[u8]>); 3] =
            [(5, Some(b"page2")), (5, Some(b"page3")), (2, None)];

        let mut page_requests = 0;
        for (rows_count, next_state) in pages {
            let query = read_frame(&mut socket).await;
            assert_eq!(query.opcode, OPCODE_QUERY);
            page_requests += 1;
            write_response(
                &mut socket,
                query.stream,
                OPCODE_RESULT,
                &rows_page_body(rows_count, next_state),
            )
            .await;
        }

        page_requests
    });

    let (connection, _error_receiver) = open_connection(None, addr, test_connection_config())
        .await
        .unwrap();
    let connection = Arc::new(connection);

    let mut query = Query::new("SELECT a FROM ks.t");
    query.set_page_size(5);

    let mut iterator = RowIterator::new_for_connection_query_iter(query, connection)
        .await
        .unwrap();

    let mut total_rows = 0;
    while let Some(row) = iterator.next().await {
        row.unwrap();
        total_rows += 1;
    }

    assert_eq!(total_rows, 12);
    assert_eq!(server.await.unwrap(), 3);
}
