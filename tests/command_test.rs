mod common;

use common::*;
use sqlfe_server::config::{Config, MultiStatementMode};
use sqlfe_server::error::ER_MULTI_STATEMENT_DISABLED;
use sqlfe_server::mysql::protocol::*;

#[tokio::test]
async fn test_ping_and_sleep() {
    let server = memory_server(test_config());
    let mut client = connect_root(&server).await;

    client.command(Command::Ping, &[]).await;
    client.read_reply().await.assert_ok();

    // COM_SLEEP has no reply; the ping behind it is the next thing answered.
    client.command(Command::Sleep, &[]).await;
    client.command(Command::Ping, &[]).await;
    client.read_reply().await.assert_ok();
}

#[tokio::test]
async fn test_empty_query() {
    let server = memory_server(test_config());
    let mut client = connect_root(&server).await;
    assert_eq!(client.query("").await.err_code(), 1065);
    assert_eq!(client.query("  ;  ").await.err_code(), 1065);
    assert!(matches!(client.query("SELECT 1").await, Reply::Rows(_)));
}

#[tokio::test]
async fn test_query_with_trailing_nul() {
    let server = memory_server(test_config());
    let mut client = connect_root(&server).await;
    client.command(Command::Query, b"SELECT 7\0").await;
    let rows = client.read_reply().await.rows();
    assert_eq!(rows.rows, vec![vec![Some("7".to_string())]]);
}

#[tokio::test]
async fn test_init_db() {
    let server = memory_server(test_config());
    let mut client = connect_root(&server).await;

    client.command(Command::InitDb, b"test").await;
    client.read_reply().await.assert_ok();
    let rows = client.query("SELECT DATABASE()").await.rows();
    assert_eq!(rows.rows, vec![vec![Some("test".to_string())]]);

    client.command(Command::InitDb, b"missing").await;
    assert_eq!(client.read_reply().await.err_code(), 1049);
}

#[tokio::test]
async fn test_table_scan_through_text_protocol() {
    let server = memory_server(test_config());
    let mut client = connect_root(&server).await;
    let rows = client.query("SELECT name FROM test.items WHERE id = '3'").await.rows();
    assert_eq!(rows.columns, vec!["name".to_string()]);
    assert_eq!(rows.rows, vec![vec![Some("item-3".to_string())]]);

    let all = client.query("SELECT * FROM test.items").await.rows();
    assert_eq!(all.rows.len(), ITEM_ROWS);
}

#[tokio::test]
async fn test_field_list() {
    let server = memory_server(test_config());
    let mut client = connect_root(&server).await;
    client.command(Command::InitDb, b"test").await;
    client.read_reply().await.assert_ok();

    client.command(Command::FieldList, b"items\0").await;
    let mut names = Vec::new();
    loop {
        let packet = client.read().await;
        if is_eof(&packet) {
            break;
        }
        let mut r = PayloadReader::new(&packet);
        for _ in 0..4 {
            r.lenenc_bytes().unwrap();
        }
        names.push(lossy_string(r.lenenc_bytes().unwrap()));
    }
    assert_eq!(names, vec!["id", "name"]);

    client.command(Command::FieldList, b"nope\0").await;
    assert_eq!(client.read_reply().await.err_code(), 1146);
}

#[tokio::test]
async fn test_statistics() {
    let server = memory_server(test_config());
    let mut client = connect_root(&server).await;
    client.command(Command::Statistics, &[]).await;
    let packet = client.read().await;
    let text = String::from_utf8(packet).unwrap();
    assert!(text.starts_with("Uptime: "), "{}", text);
    assert!(text.contains("Threads: 1"), "{}", text);
}

#[tokio::test]
async fn test_refresh_and_shutdown_reply_ok() {
    let server = memory_server(test_config());
    let mut client = connect_root(&server).await;
    client.command(Command::Refresh, &[0x01]).await;
    client.read_reply().await.assert_ok();
    client.command(Command::Shutdown, &[]).await;
    client.read_reply().await.assert_ok();
}

#[tokio::test]
async fn test_unknown_command_keeps_connection() {
    let server = memory_server(test_config());
    let mut client = connect_root(&server).await;
    client.command(Command::BinlogDump, &[]).await;
    assert_eq!(client.read_reply().await.err_code(), 1105);
    assert!(matches!(client.query("SELECT 1").await, Reply::Rows(_)));
}

#[tokio::test]
async fn test_quit_closes_connection() {
    let server = memory_server(test_config());
    let (mut client, task) = connect(&server).await;
    client.login("root", "", None).await.assert_ok();
    client.command(Command::Quit, &[]).await;
    assert!(client.read_until_closed().await.is_empty());
    task.await.unwrap();
    assert_eq!(server.context().connection_count(), 0);
}

#[tokio::test]
async fn test_transaction_status_bits() {
    let server = memory_server(test_config());
    let mut client = connect_root(&server).await;
    let begin = client.query("BEGIN").await;
    assert_ne!(begin.status() & SERVER_STATUS_IN_TRANS, 0);
    let rows = client.query("SELECT 1").await;
    assert_ne!(rows.status() & SERVER_STATUS_IN_TRANS, 0);
    let commit = client.query("COMMIT").await;
    assert_eq!(commit.status() & SERVER_STATUS_IN_TRANS, 0);
}

#[tokio::test]
async fn test_change_user() {
    let server = memory_server(test_config());
    let mut client = connect_root(&server).await;
    client.query("BEGIN").await.assert_ok();

    let scramble = native_auth("secret", &client.greeting.salt.clone());
    let mut body = b"app\0".to_vec();
    body.push(scramble.len() as u8);
    body.extend_from_slice(&scramble);
    body.extend_from_slice(b"test\0");
    client.command(Command::ChangeUser, &body).await;
    let reply = client.read_reply().await;
    assert_eq!(reply.status() & SERVER_STATUS_IN_TRANS, 0);

    let rows = client.query("SELECT USER(), DATABASE()").await.rows();
    assert_eq!(
        rows.rows,
        vec![vec![Some("app@127.0.0.1".to_string()), Some("test".to_string())]]
    );
}

#[tokio::test]
async fn test_change_user_with_bad_password_closes() {
    let server = memory_server(test_config());
    let mut client = connect_root(&server).await;
    let mut body = b"app\0".to_vec();
    body.push(3);
    body.extend_from_slice(b"bad");
    client.command(Command::ChangeUser, &body).await;
    let packets = client.read_until_closed().await;
    assert_eq!(parse_simple_reply(&packets[0]).err_code(), 1045);
}

#[tokio::test]
async fn test_reset_connection_drops_session_state() {
    let server = memory_server(test_config());
    let mut client = connect_root(&server).await;
    client.query("SET @@sql_mode = 'ANSI'").await.assert_ok();
    client.query("BEGIN").await.assert_ok();

    client.command(Command::ResetConnection, &[]).await;
    let reply = client.read_reply().await;
    assert_eq!(reply.status() & SERVER_STATUS_IN_TRANS, 0);
    let rows = client.query("SELECT @@sql_mode").await.rows();
    assert_ne!(rows.rows, vec![vec![Some("ANSI".to_string())]]);
}

fn multi_config(mode: MultiStatementMode) -> Config {
    Config {
        multi_statement_mode: mode,
        ..test_config()
    }
}

#[tokio::test]
async fn test_multi_statement_rejected_without_capability() {
    let server = memory_server(multi_config(MultiStatementMode::Off));
    let mut client = connect_root(&server).await;
    let reply = client
        .query("INSERT INTO test.items VALUES ('100', 'x'); SELECT 1")
        .await;
    assert_eq!(reply.err_code(), ER_MULTI_STATEMENT_DISABLED);

    // Nothing ran.
    let rows = client.query("SELECT * FROM test.items WHERE id = '100'").await.rows();
    assert!(rows.rows.is_empty());
}

#[tokio::test]
async fn test_multi_statement_warn_mode_runs_first_only() {
    let server = memory_server(multi_config(MultiStatementMode::Warn));
    let mut client = connect_root(&server).await;
    let rows = client.query("SELECT 1; SELECT 2").await.rows();
    assert_eq!(rows.rows, vec![vec![Some("1".to_string())]]);
    assert_eq!(rows.warnings, 1);
    assert_eq!(rows.status & SERVER_MORE_RESULTS_EXISTS, 0);

    let warnings = client.query("SHOW WARNINGS").await.rows();
    assert_eq!(warnings.rows.len(), 1);
    assert_eq!(warnings.rows[0][1].as_deref(), Some("8130"));
}

#[tokio::test]
async fn test_multi_statement_mode_from_session_variable() {
    let server = memory_server(multi_config(MultiStatementMode::Off));
    let mut client = connect_root(&server).await;
    client.query("SET multi_statement_mode = 'ON'").await.assert_ok();
    let first = client.query("SELECT 1; SELECT 2").await.rows();
    assert_ne!(first.status & SERVER_MORE_RESULTS_EXISTS, 0);
    let second = client.read_reply().await.rows();
    assert_eq!(second.rows, vec![vec![Some("2".to_string())]]);
}

#[tokio::test]
async fn test_multi_statement_with_capability() {
    let server = memory_server(multi_config(MultiStatementMode::Off));
    let (mut client, _task) = connect(&server).await;
    client.capability |= CLIENT_MULTI_STATEMENTS;
    client.login("root", "", None).await.assert_ok();

    let first = client.query("BEGIN; SELECT 1; COMMIT").await;
    assert_ne!(first.status() & SERVER_MORE_RESULTS_EXISTS, 0);
    let second = client.read_reply().await;
    assert_ne!(second.status() & SERVER_MORE_RESULTS_EXISTS, 0);
    assert_ne!(second.status() & SERVER_STATUS_IN_TRANS, 0);
    let third = client.read_reply().await;
    third.assert_ok();
    assert_eq!(third.status() & SERVER_MORE_RESULTS_EXISTS, 0);
}

#[tokio::test]
async fn test_set_option_toggles_multi_statements() {
    let server = memory_server(multi_config(MultiStatementMode::Off));
    let mut client = connect_root(&server).await;

    client.command(Command::SetOption, &0u16.to_le_bytes()).await;
    assert!(is_eof(&client.read().await));
    let first = client.query("SELECT 1; SELECT 2").await;
    assert_ne!(first.status() & SERVER_MORE_RESULTS_EXISTS, 0);
    client.read_reply().await.rows();

    client.command(Command::SetOption, &1u16.to_le_bytes()).await;
    assert!(is_eof(&client.read().await));
    assert_eq!(client.query("SELECT 1; SELECT 2").await.err_code(), ER_MULTI_STATEMENT_DISABLED);
}

#[tokio::test]
async fn test_prepared_statement_binary_rows() {
    let server = memory_server(test_config());
    let mut client = connect_root(&server).await;
    let (stmt_id, columns, params) = client
        .prepare("SELECT name FROM test.items WHERE id = ?")
        .await
        .unwrap();
    assert_eq!((columns, params), (1, 1));

    client.execute(stmt_id, false, &[Some("3")]).await;
    let count = client.read().await;
    assert_eq!(count, vec![1]);
    client.read_columns(1).await;
    let (rows, status) = client.read_raw_rows().await;
    assert_eq!(status & SERVER_STATUS_CURSOR_EXISTS, 0);
    assert_eq!(rows.len(), 1);
    // 0x00 header, one bitmap byte, then the length-encoded string.
    assert_eq!(rows[0][0], 0x00);
    assert_eq!(&rows[0][2..], b"\x06item-3");

    client.command(Command::StmtClose, &stmt_id.to_le_bytes()).await;
    client.execute(stmt_id, false, &[Some("3")]).await;
    assert_eq!(client.read_reply().await.err_code(), 1243);
}

#[tokio::test]
async fn test_cursor_fetch_pages() {
    let server = memory_server(test_config());
    let mut client = connect_root(&server).await;
    let (stmt_id, columns, _) = client.prepare("SELECT * FROM test.items").await.unwrap();
    assert_eq!(columns, 2);

    client.execute(stmt_id, true, &[]).await;
    assert_eq!(client.read().await, vec![2]);
    for _ in 0..2 {
        client.read().await;
    }
    let eof = client.read().await;
    assert!(is_eof(&eof));
    assert_ne!(parse_eof(&eof).1 & SERVER_STATUS_CURSOR_EXISTS, 0);

    let mut pages = Vec::new();
    for _ in 0..3 {
        client.fetch(stmt_id, 10).await;
        let (rows, status) = client.read_raw_rows().await;
        pages.push((rows.len(), status));
    }
    assert_eq!(pages[0].0, 10);
    assert_eq!(pages[1].0, 10);
    assert_eq!(pages[2].0, 5);
    assert_ne!(pages[0].1 & SERVER_STATUS_CURSOR_EXISTS, 0);
    assert_ne!(pages[1].1 & SERVER_STATUS_CURSOR_EXISTS, 0);
    assert_eq!(pages[2].1 & SERVER_STATUS_CURSOR_EXISTS, 0);
    assert_ne!(pages[2].1 & SERVER_STATUS_LAST_ROW_SENT, 0);

    client.fetch(stmt_id, 10).await;
    assert_eq!(client.read_reply().await.err_code(), 1421);
}

#[tokio::test]
async fn test_fetch_unknown_statement() {
    let server = memory_server(test_config());
    let mut client = connect_root(&server).await;
    client.fetch(42, 10).await;
    assert_eq!(client.read_reply().await.err_code(), 1243);
}

#[tokio::test]
async fn test_stmt_reset_closes_cursor() {
    let server = memory_server(test_config());
    let mut client = connect_root(&server).await;
    let (stmt_id, _, _) = client.prepare("SELECT * FROM test.items").await.unwrap();
    client.execute(stmt_id, true, &[]).await;
    client.read().await;
    client.read_columns(2).await;

    client.command(Command::StmtReset, &stmt_id.to_le_bytes()).await;
    client.read_reply().await.assert_ok();
    client.fetch(stmt_id, 10).await;
    assert_eq!(client.read_reply().await.err_code(), 1421);
}

#[tokio::test]
async fn test_send_long_data_is_silent() {
    let server = memory_server(test_config());
    let mut client = connect_root(&server).await;
    let (stmt_id, _, _) = client
        .prepare("SELECT name FROM test.items WHERE id = ?")
        .await
        .unwrap();

    let mut body = stmt_id.to_le_bytes().to_vec();
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(b"4");
    client.command(Command::StmtSendLongData, &body).await;

    // No reply to long data: the next thing on the wire answers the ping.
    client.command(Command::Ping, &[]).await;
    client.read_reply().await.assert_ok();
}
