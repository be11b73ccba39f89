use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_util::codec::Framed;

use pgwired::auth::{Authenticator, PasswordTable, Trust};
use pgwired::codec::ClientCodec;
use pgwired::config::Config;
use pgwired::engine::LiteralEngine;
use pgwired::messages::{
    Authentication, BackendKeyData, BackendMessage, Bind, CancelRequest, CommandComplete,
    CopyData, CopyDone, CopyFail, DataRow, Describe, Execute, Flush, FrontendMessage,
    NegotiationResponse, ParameterDescription, ParameterStatus, Parse, PasswordMessage, Query,
    ReadyForQuery, SslRequest, Startup, Target, TransactionStatus,
};
use pgwired::server::{Server, ServerHandle};
use pgwired::types::{oid, FormatCode, Value};

const WAIT: Duration = Duration::from_secs(5);

async fn start(
    engine: LiteralEngine,
    authenticator: Arc<dyn Authenticator>,
) -> (SocketAddr, ServerHandle) {
    let config = Config {
        port: 0,
        ..Config::default()
    };
    let server = Server::bind(config, engine, authenticator).await.unwrap();
    let addr = server.local_addr().unwrap();
    let handle = server.handle();
    tokio::spawn(server.serve());
    (addr, handle)
}

struct Client {
    framed: Framed<TcpStream, ClientCodec>,
    key: Option<BackendKeyData>,
}

impl Client {
    async fn open(addr: SocketAddr) -> Client {
        let stream = TcpStream::connect(addr).await.unwrap();
        Client {
            framed: Framed::new(stream, ClientCodec::default()),
            key: None,
        }
    }

    /// Connects and completes startup as `user` without a password.
    async fn connect(addr: SocketAddr, user: &str) -> Client {
        let mut client = Client::open(addr).await;
        client.send(Startup::new([("user", user), ("database", "test")])).await;
        let messages = client.until_ready().await;
        client.key = messages.iter().find_map(|m| match m {
            BackendMessage::BackendKeyData(key) => Some(key.clone()),
            _ => None,
        });
        client
    }

    async fn send(&mut self, message: impl Into<FrontendMessage>) {
        self.framed.send(message.into()).await.unwrap();
    }

    async fn recv(&mut self) -> Option<BackendMessage> {
        timeout(WAIT, self.framed.next())
            .await
            .expect("timed out waiting for the server")
            .map(Result::unwrap)
    }

    /// Everything up to and including the next ReadyForQuery.
    async fn until_ready(&mut self) -> Vec<BackendMessage> {
        let mut messages = Vec::new();
        loop {
            let message = self.recv().await.expect("connection closed early");
            let ready = matches!(message, BackendMessage::ReadyForQuery(_));
            messages.push(message);
            if ready {
                return messages;
            }
        }
    }

    async fn query(&mut self, sql: &str) -> Vec<BackendMessage> {
        self.send(Query { query: sql.into() }).await;
        self.until_ready().await
    }
}

fn ready(status: TransactionStatus) -> BackendMessage {
    ReadyForQuery { status }.into()
}

fn complete(tag: &str) -> BackendMessage {
    CommandComplete { tag: tag.into() }.into()
}

fn text_row(values: &[&'static str]) -> BackendMessage {
    DataRow {
        values: values
            .iter()
            .map(|v| Some(Bytes::from_static(v.as_bytes())))
            .collect(),
    }
    .into()
}

fn error_code(message: &BackendMessage) -> Option<&str> {
    match message {
        BackendMessage::ErrorResponse(error) => error.code(),
        _ => None,
    }
}

fn table_engine() -> LiteralEngine {
    LiteralEngine::new().with_table(
        "t",
        &[("id", oid::INT4)],
        vec![vec![Value::Int4(1)], vec![Value::Int4(2)]],
    )
}

#[tokio::test]
async fn startup_reports_parameters_and_key() {
    let (addr, _handle) = start(LiteralEngine::new(), Arc::new(Trust)).await;
    let mut client = Client::open(addr).await;

    client.send(Startup::new([("user", "alice")])).await;
    let messages = client.until_ready().await;

    assert_eq!(messages[0], Authentication::Ok.into());
    assert!(messages.contains(&ParameterStatus::new("server_encoding", "UTF8").into()));
    assert!(messages.contains(&ParameterStatus::new("client_encoding", "UTF8").into()));
    assert!(messages
        .iter()
        .any(|m| matches!(m, BackendMessage::BackendKeyData(_))));
    assert_eq!(messages.last(), Some(&ready(TransactionStatus::Idle)));
}

#[tokio::test]
async fn ssl_request_is_declined() {
    let (addr, _handle) = start(LiteralEngine::new(), Arc::new(Trust)).await;
    let mut client = Client::open(addr).await;

    client.framed.codec_mut().expect_negotiation_response();
    client.send(SslRequest).await;
    assert_eq!(
        client.recv().await,
        Some(NegotiationResponse::DECLINE.into())
    );

    client.send(Startup::new([("user", "alice")])).await;
    let messages = client.until_ready().await;
    assert_eq!(messages.last(), Some(&ready(TransactionStatus::Idle)));
}

#[tokio::test]
async fn missing_user_is_fatal() {
    let (addr, _handle) = start(LiteralEngine::new(), Arc::new(Trust)).await;
    let mut client = Client::open(addr).await;

    client.send(Startup::new([("database", "test")])).await;

    let error = client.recv().await.unwrap();
    assert_eq!(error_code(&error), Some("28000"));
    assert_eq!(client.recv().await, None);
}

#[tokio::test]
async fn wrong_password_closes_the_connection() {
    let authenticator = Arc::new(PasswordTable::new().with_user("alice", "secret"));
    let (addr, _handle) = start(LiteralEngine::new(), authenticator).await;
    let mut client = Client::open(addr).await;

    client.send(Startup::new([("user", "alice")])).await;
    assert_eq!(
        client.recv().await,
        Some(Authentication::CleartextPassword.into())
    );
    client
        .send(PasswordMessage {
            password: "wrong".into(),
        })
        .await;

    let error = client.recv().await.unwrap();
    assert_eq!(error_code(&error), Some("28P01"));
    assert_eq!(client.recv().await, None);
}

#[tokio::test]
async fn right_password_starts_the_session() {
    let authenticator = Arc::new(PasswordTable::new().with_user("alice", "secret"));
    let (addr, _handle) = start(LiteralEngine::new(), authenticator).await;
    let mut client = Client::open(addr).await;

    client.send(Startup::new([("user", "alice")])).await;
    assert_eq!(
        client.recv().await,
        Some(Authentication::CleartextPassword.into())
    );
    client
        .send(PasswordMessage {
            password: "secret".into(),
        })
        .await;

    let messages = client.until_ready().await;
    assert_eq!(messages[0], Authentication::Ok.into());
}

#[tokio::test]
async fn simple_query_select_one() {
    let (addr, _handle) = start(LiteralEngine::new(), Arc::new(Trust)).await;
    let mut client = Client::connect(addr, "alice").await;

    let messages = client.query("SELECT 1").await;

    assert_eq!(messages.len(), 4);
    match &messages[0] {
        BackendMessage::RowDescription(description) => {
            assert_eq!(description.fields.len(), 1);
            assert_eq!(description.fields[0].type_oid, oid::INT4);
            assert_eq!(description.fields[0].format, FormatCode::Text);
        }
        other => panic!("expected RowDescription, got {other:?}"),
    }
    assert_eq!(messages[1], text_row(&["1"]));
    assert_eq!(messages[2], complete("SELECT 1"));
    assert_eq!(messages[3], ready(TransactionStatus::Idle));
}

#[tokio::test]
async fn empty_query() {
    let (addr, _handle) = start(LiteralEngine::new(), Arc::new(Trust)).await;
    let mut client = Client::connect(addr, "alice").await;

    let messages = client.query("  ;  ").await;

    assert!(matches!(messages[0], BackendMessage::EmptyQueryResponse(_)));
    assert_eq!(messages[1], ready(TransactionStatus::Idle));
}

#[tokio::test]
async fn simple_query_error_keeps_the_connection() {
    let (addr, _handle) = start(LiteralEngine::new(), Arc::new(Trust)).await;
    let mut client = Client::connect(addr, "alice").await;

    let messages = client.query("FROB 1").await;
    assert_eq!(error_code(&messages[0]), Some("42601"));
    assert_eq!(messages[1], ready(TransactionStatus::Idle));

    let messages = client.query("SELECT 'still here'").await;
    assert_eq!(messages[1], text_row(&["still here"]));
}

#[tokio::test]
async fn failed_transaction_rejects_until_rollback() {
    let (addr, _handle) = start(LiteralEngine::new(), Arc::new(Trust)).await;
    let mut client = Client::connect(addr, "alice").await;

    let messages = client.query("BEGIN").await;
    assert_eq!(
        messages,
        vec![complete("BEGIN"), ready(TransactionStatus::InTransaction)]
    );

    let messages = client.query("SELECT * FROM missing").await;
    assert_eq!(error_code(&messages[0]), Some("42P01"));
    assert_eq!(messages[1], ready(TransactionStatus::Failed));

    let messages = client.query("SELECT 1").await;
    assert_eq!(error_code(&messages[0]), Some("25P02"));
    assert_eq!(messages[1], ready(TransactionStatus::Failed));

    let messages = client.query("COMMIT").await;
    assert_eq!(
        messages,
        vec![complete("ROLLBACK"), ready(TransactionStatus::Idle)]
    );
}

#[tokio::test]
async fn extended_query_partial_fetch() {
    let (addr, _handle) = start(table_engine(), Arc::new(Trust)).await;
    let mut client = Client::connect(addr, "alice").await;

    client
        .send(Parse {
            name: String::new(),
            query: "SELECT * FROM t".into(),
            parameter_types: Vec::new(),
        })
        .await;
    client.send(Bind::default()).await;
    for _ in 0..2 {
        client
            .send(Execute {
                portal: String::new(),
                max_rows: 1,
            })
            .await;
    }
    client.send(pgwired::messages::Sync).await;

    let messages = client.until_ready().await;
    assert!(matches!(messages[0], BackendMessage::ParseComplete(_)));
    assert!(matches!(messages[1], BackendMessage::BindComplete(_)));
    assert_eq!(messages[2], text_row(&["1"]));
    assert!(matches!(messages[3], BackendMessage::PortalSuspended(_)));
    assert_eq!(messages[4], text_row(&["2"]));
    assert_eq!(messages[5], complete("SELECT 1"));
    assert_eq!(messages[6], ready(TransactionStatus::Idle));
}

#[tokio::test]
async fn describe_and_binary_results() {
    let (addr, _handle) = start(LiteralEngine::new(), Arc::new(Trust)).await;
    let mut client = Client::connect(addr, "alice").await;

    client
        .send(Parse {
            name: "s".into(),
            query: "SELECT $1::int4 AS n".into(),
            parameter_types: Vec::new(),
        })
        .await;
    client
        .send(Describe {
            target: Target::Statement,
            name: "s".into(),
        })
        .await;
    client
        .send(Bind {
            statement: "s".into(),
            parameters: vec![Some(Bytes::from_static(b"42"))],
            result_formats: vec![FormatCode::Binary.as_i16()],
            ..Bind::default()
        })
        .await;
    client
        .send(Execute {
            portal: String::new(),
            max_rows: 0,
        })
        .await;
    client.send(pgwired::messages::Sync).await;

    let messages = client.until_ready().await;
    assert!(matches!(messages[0], BackendMessage::ParseComplete(_)));
    assert_eq!(
        messages[1],
        ParameterDescription {
            types: vec![oid::INT4]
        }
        .into()
    );
    match &messages[2] {
        BackendMessage::RowDescription(description) => {
            assert_eq!(description.fields[0].name, "n");
        }
        other => panic!("expected RowDescription, got {other:?}"),
    }
    assert!(matches!(messages[3], BackendMessage::BindComplete(_)));
    assert_eq!(
        messages[4],
        DataRow {
            values: vec![Some(Bytes::copy_from_slice(&42i32.to_be_bytes()))]
        }
        .into()
    );
    assert_eq!(messages[5], complete("SELECT 1"));
    assert_eq!(messages[6], ready(TransactionStatus::Idle));
}

#[tokio::test]
async fn failed_bind_discards_until_sync() {
    let (addr, _handle) = start(table_engine(), Arc::new(Trust)).await;
    let mut client = Client::connect(addr, "alice").await;

    client
        .send(Parse {
            name: String::new(),
            query: "SELECT * FROM t".into(),
            parameter_types: Vec::new(),
        })
        .await;
    // The statement takes no parameters.
    client
        .send(Bind {
            parameters: vec![Some(Bytes::from_static(b"5"))],
            ..Bind::default()
        })
        .await;
    client
        .send(Describe {
            target: Target::Portal,
            name: String::new(),
        })
        .await;
    client
        .send(Execute {
            portal: String::new(),
            max_rows: 0,
        })
        .await;
    client
        .send(Query {
            query: "SELECT 1".into(),
        })
        .await;
    client.send(pgwired::messages::Sync).await;

    let messages = client.until_ready().await;
    assert_eq!(messages.len(), 3);
    assert!(matches!(messages[0], BackendMessage::ParseComplete(_)));
    assert_eq!(error_code(&messages[1]), Some("08P01"));
    assert_eq!(messages[2], ready(TransactionStatus::Idle));

    // Normal service resumes after the Sync.
    let messages = client.query("SELECT 1").await;
    assert_eq!(messages[1], text_row(&["1"]));
}

#[tokio::test]
async fn failed_extended_query_in_transaction_reports_failed_status() {
    let (addr, _handle) = start(table_engine(), Arc::new(Trust)).await;
    let mut client = Client::connect(addr, "alice").await;
    client.query("BEGIN").await;

    client
        .send(Bind {
            statement: "missing".into(),
            ..Bind::default()
        })
        .await;
    client
        .send(Execute {
            portal: String::new(),
            max_rows: 0,
        })
        .await;
    client.send(pgwired::messages::Sync).await;

    let messages = client.until_ready().await;
    assert_eq!(messages.len(), 2);
    assert_eq!(error_code(&messages[0]), Some("26000"));
    assert_eq!(messages[1], ready(TransactionStatus::Failed));

    let messages = client.query("ROLLBACK").await;
    assert_eq!(messages.last(), Some(&ready(TransactionStatus::Idle)));
}

#[tokio::test]
async fn unknown_message_type_closes_the_connection() {
    let (addr, _handle) = start(LiteralEngine::new(), Arc::new(Trust)).await;
    let mut client = Client::connect(addr, "alice").await;

    client
        .framed
        .get_mut()
        .write_all(&[b'?', 0, 0, 0, 4])
        .await
        .unwrap();

    let error = client.recv().await.unwrap();
    assert_eq!(error_code(&error), Some("08P01"));
    assert_eq!(client.recv().await, None);
}

#[tokio::test]
async fn cancel_request_interrupts_running_query() {
    let (addr, _handle) = start(LiteralEngine::new(), Arc::new(Trust)).await;
    let mut client = Client::connect(addr, "alice").await;
    let key = client.key.clone().unwrap();

    client
        .send(Query {
            query: "SELECT pg_sleep(30)".into(),
        })
        .await;
    sleep(Duration::from_millis(200)).await;

    let mut canceller = Client::open(addr).await;
    canceller
        .send(CancelRequest {
            process_id: key.process_id,
            secret_key: key.secret_key,
        })
        .await;
    assert_eq!(canceller.recv().await, None);

    let messages = client.until_ready().await;
    assert_eq!(error_code(&messages[0]), Some("57014"));
    assert_eq!(messages.last(), Some(&ready(TransactionStatus::Idle)));
}

#[tokio::test]
async fn cancel_request_with_wrong_key_is_ignored() {
    let (addr, _handle) = start(LiteralEngine::new(), Arc::new(Trust)).await;
    let mut client = Client::connect(addr, "alice").await;
    let key = client.key.clone().unwrap();

    client
        .send(Query {
            query: "SELECT pg_sleep(0.3)".into(),
        })
        .await;

    let mut canceller = Client::open(addr).await;
    canceller
        .send(CancelRequest {
            process_id: key.process_id,
            secret_key: key.secret_key.wrapping_add(1),
        })
        .await;
    assert_eq!(canceller.recv().await, None);

    let messages = client.until_ready().await;
    assert_eq!(messages[messages.len() - 2], complete("SELECT 1"));
}

#[tokio::test]
async fn copy_in_then_out() {
    let engine = LiteralEngine::new().with_table(
        "items",
        &[("id", oid::INT4), ("name", oid::TEXT)],
        Vec::new(),
    );
    let (addr, _handle) = start(engine.clone(), Arc::new(Trust)).await;
    let mut client = Client::connect(addr, "alice").await;

    client
        .send(Query {
            query: "COPY items FROM STDIN".into(),
        })
        .await;
    assert!(matches!(
        client.recv().await,
        Some(BackendMessage::CopyInResponse(_))
    ));
    // A row split across chunks.
    for chunk in ["1\tone\n2\t", "\\N\n"] {
        client
            .send(CopyData {
                data: Bytes::from_static(chunk.as_bytes()),
            })
            .await;
    }
    client.send(CopyDone).await;

    let messages = client.until_ready().await;
    assert_eq!(
        messages,
        vec![complete("COPY 2"), ready(TransactionStatus::Idle)]
    );
    assert_eq!(
        engine.rows("items").unwrap(),
        vec![
            vec![Value::Int4(1), Value::Text("one".into())],
            vec![Value::Int4(2), Value::Null],
        ]
    );

    let messages = client.query("COPY items TO STDOUT").await;
    assert!(matches!(messages[0], BackendMessage::CopyOutResponse(_)));
    assert_eq!(
        messages[1],
        CopyData {
            data: Bytes::from_static(b"1\tone\n")
        }
        .into()
    );
    assert_eq!(
        messages[2],
        CopyData {
            data: Bytes::from_static(b"2\t\\N\n")
        }
        .into()
    );
    assert!(matches!(messages[3], BackendMessage::CopyDone(_)));
    assert_eq!(messages[4], complete("COPY 2"));
}

#[tokio::test]
async fn copy_fail_aborts_the_copy() {
    let engine = LiteralEngine::new().with_table("items", &[("id", oid::INT4)], Vec::new());
    let (addr, _handle) = start(engine.clone(), Arc::new(Trust)).await;
    let mut client = Client::connect(addr, "alice").await;

    client
        .send(Query {
            query: "COPY items FROM STDIN".into(),
        })
        .await;
    assert!(matches!(
        client.recv().await,
        Some(BackendMessage::CopyInResponse(_))
    ));
    client
        .send(CopyData {
            data: Bytes::from_static(b"1\n"),
        })
        .await;
    client
        .send(CopyFail {
            message: "changed my mind".into(),
        })
        .await;

    let messages = client.until_ready().await;
    assert_eq!(error_code(&messages[0]), Some("57014"));
    assert_eq!(messages[1], ready(TransactionStatus::Idle));
    assert_eq!(engine.rows("items").unwrap(), Vec::<Vec<Value>>::new());
}

#[tokio::test]
async fn stop_closes_live_connections() {
    let (addr, handle) = start(LiteralEngine::new(), Arc::new(Trust)).await;
    let mut client = Client::connect(addr, "alice").await;

    handle.stop();

    let error = client.recv().await.unwrap();
    assert_eq!(error_code(&error), Some("57P01"));
    assert_eq!(client.recv().await, None);
    timeout(WAIT, handle.wait_for_stop()).await.unwrap();
}

#[tokio::test]
async fn stop_before_startup_packet() {
    let (addr, handle) = start(LiteralEngine::new(), Arc::new(Trust)).await;
    let mut client = Client::open(addr).await;
    // Let the server pick the socket up before stopping.
    sleep(Duration::from_millis(100)).await;

    handle.stop();

    timeout(WAIT, handle.wait_for_stop()).await.unwrap();
    assert_eq!(client.recv().await, None);
}

#[tokio::test]
async fn stop_at_password_prompt() {
    let authenticator = Arc::new(PasswordTable::new().with_user("alice", "secret"));
    let (addr, handle) = start(LiteralEngine::new(), authenticator).await;
    let mut client = Client::open(addr).await;

    client.send(Startup::new([("user", "alice")])).await;
    assert_eq!(
        client.recv().await,
        Some(Authentication::CleartextPassword.into())
    );

    handle.stop();

    let error = client.recv().await.unwrap();
    assert_eq!(error_code(&error), Some("57P01"));
    assert_eq!(client.recv().await, None);
    timeout(WAIT, handle.wait_for_stop()).await.unwrap();
}

#[tokio::test]
async fn flush_delivers_error_before_sync() {
    let (addr, _handle) = start(LiteralEngine::new(), Arc::new(Trust)).await;
    let mut client = Client::connect(addr, "alice").await;

    client
        .send(Bind {
            statement: "missing".into(),
            ..Bind::default()
        })
        .await;
    client.send(Flush).await;

    let error = client.recv().await.unwrap();
    assert_eq!(error_code(&error), Some("26000"));

    client.send(pgwired::messages::Sync).await;
    assert_eq!(client.recv().await, Some(ready(TransactionStatus::Idle)));
}

#[tokio::test]
async fn error_responses_carry_severity() {
    let (addr, _handle) = start(LiteralEngine::new(), Arc::new(Trust)).await;
    let mut client = Client::connect(addr, "alice").await;

    let messages = client.query("SELECT * FROM nowhere").await;

    match &messages[0] {
        BackendMessage::ErrorResponse(error) => {
            assert_eq!(error.severity(), Some("ERROR"));
            assert_eq!(error.message(), Some("relation \"nowhere\" does not exist"));
        }
        other => panic!("expected ErrorResponse, got {other:?}"),
    }
}
