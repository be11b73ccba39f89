//! Per-connection protocol state.
//!
//! Owned by exactly one connection and passed by `&mut` through its message loop.

use std::collections::HashMap;
use std::str::FromStr;

use futures::stream::Peekable;
use strum_macros::EnumString;

use crate::engine::{Column, CommandTag, Description, ExecutionError, RowStream, SessionInfo};
use crate::error::sql_state;
use crate::messages::TransactionStatus;
use crate::types::{FormatCode, Value};

/// A parsed statement produced by Parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub query: String,
    pub description: Description,
}

/// Execution progress of a portal.
pub enum Cursor {
    /// Bound but not yet executed.
    Pending,
    /// Executed; rows are pulled on demand by each Execute.
    Rows {
        columns: Vec<Column>,
        rows: Peekable<RowStream>,
    },
    /// Every row has been returned, or the statement produced no rows.
    Done,
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cursor::Pending => f.write_str("Pending"),
            Cursor::Rows { columns, .. } => f
                .debug_struct("Rows")
                .field("columns", columns)
                .finish_non_exhaustive(),
            Cursor::Done => f.write_str("Done"),
        }
    }
}

/// A bound statement produced by Bind and consumed by Execute.
#[derive(Debug)]
pub struct Portal {
    /// Name of the source statement.
    pub statement: String,
    pub query: String,
    pub parameters: Vec<Value>,
    /// Columns as described when the statement was parsed.
    pub columns: Vec<Column>,
    /// One result format per described column.
    pub formats: Vec<FormatCode>,
    pub cursor: Cursor,
}

pub struct Session {
    pub info: SessionInfo,
    status: TransactionStatus,
    statements: HashMap<String, Statement>,
    portals: HashMap<String, Portal>,
    /// Set after an error in an extended query batch; everything but Sync is skipped.
    ignore_till_sync: bool,
}

impl Session {
    pub fn new(info: SessionInfo) -> Self {
        Self {
            info,
            status: TransactionStatus::Idle,
            statements: HashMap::new(),
            portals: HashMap::new(),
            ignore_till_sync: false,
        }
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Stores a parsed statement. The unnamed statement is silently replaced; a named one must
    /// be closed first.
    pub fn put_statement(
        &mut self,
        name: String,
        statement: Statement,
    ) -> Result<(), ExecutionError> {
        if !name.is_empty() && self.statements.contains_key(&name) {
            return Err(ExecutionError::new(
                sql_state::DUPLICATE_PREPARED_STATEMENT,
                format!("prepared statement \"{name}\" already exists"),
            ));
        }
        self.statements.insert(name, statement);
        Ok(())
    }

    pub fn statement(&self, name: &str) -> Result<&Statement, ExecutionError> {
        self.statements.get(name).ok_or_else(|| {
            ExecutionError::new(
                sql_state::INVALID_SQL_STATEMENT_NAME,
                format!("prepared statement \"{name}\" does not exist"),
            )
        })
    }

    /// Drops a statement together with every portal bound from it. Closing a missing
    /// statement is not an error.
    pub fn close_statement(&mut self, name: &str) {
        if self.statements.remove(name).is_some() {
            self.portals.retain(|_, portal| portal.statement != name);
        }
    }

    /// Stores a bound portal. The unnamed portal is silently replaced; a named one must be
    /// closed first.
    pub fn put_portal(&mut self, name: String, portal: Portal) -> Result<(), ExecutionError> {
        if !name.is_empty() && self.portals.contains_key(&name) {
            return Err(ExecutionError::new(
                sql_state::DUPLICATE_CURSOR,
                format!("portal \"{name}\" already exists"),
            ));
        }
        self.portals.insert(name, portal);
        Ok(())
    }

    pub fn portal(&self, name: &str) -> Result<&Portal, ExecutionError> {
        self.portals.get(name).ok_or_else(|| missing_portal(name))
    }

    pub fn portal_mut(&mut self, name: &str) -> Result<&mut Portal, ExecutionError> {
        self.portals.get_mut(name).ok_or_else(|| missing_portal(name))
    }

    /// Closing a missing portal is not an error.
    pub fn close_portal(&mut self, name: &str) {
        self.portals.remove(name);
    }

    /// A simple query replaces the unnamed statement and portal.
    pub fn drop_unnamed(&mut self) {
        self.statements.remove("");
        self.portals.remove("");
    }

    /// Tracks explicit transaction blocks from the tag of a completed command.
    pub fn apply(&mut self, tag: &CommandTag) {
        match tag.command.as_str() {
            "BEGIN" | "START TRANSACTION" => {
                if self.status == TransactionStatus::Idle {
                    self.status = TransactionStatus::InTransaction;
                }
            }
            "COMMIT" | "ROLLBACK" => {
                self.status = TransactionStatus::Idle;
                self.portals.clear();
            }
            _ => {}
        }
    }

    /// An error inside a transaction block aborts it. Outside of one there is nothing to abort.
    pub fn fail(&mut self) {
        if self.status == TransactionStatus::InTransaction {
            self.status = TransactionStatus::Failed;
        }
    }

    pub fn begin_discard(&mut self) {
        self.ignore_till_sync = true;
    }

    pub fn is_discarding(&self) -> bool {
        self.ignore_till_sync
    }

    /// Ends an extended query batch. Portals of an implicit transaction do not survive it.
    pub fn sync(&mut self) -> TransactionStatus {
        self.ignore_till_sync = false;
        if self.status == TransactionStatus::Idle {
            self.portals.clear();
        }
        self.status
    }

    /// Checks a statement against the transaction state and returns the statement to run.
    /// Once a transaction block has failed only statements ending it are accepted, and every
    /// one of them rolls back.
    pub fn admit<'a>(&self, query: &'a str) -> Result<&'a str, ExecutionError> {
        if self.status != TransactionStatus::Failed {
            return Ok(query);
        }
        if ends_transaction(query) {
            Ok("ROLLBACK")
        } else {
            Err(ExecutionError::in_failed_transaction())
        }
    }

    /// Drops every statement and portal.
    pub fn clear(&mut self) {
        self.statements.clear();
        self.portals.clear();
    }
}

fn missing_portal(name: &str) -> ExecutionError {
    ExecutionError::new(
        sql_state::INVALID_CURSOR_NAME,
        format!("portal \"{name}\" does not exist"),
    )
}

/// Statements that close a transaction block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
enum TransactionEnd {
    Commit,
    End,
    Rollback,
    Abort,
}

fn ends_transaction(query: &str) -> bool {
    let keyword = query
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == ';')
        .next()
        .unwrap_or_default();
    TransactionEnd::from_str(keyword).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statement(query: &str) -> Statement {
        Statement {
            query: query.into(),
            description: Description::default(),
        }
    }

    fn portal(statement: &str) -> Portal {
        Portal {
            statement: statement.into(),
            query: "SELECT 1".into(),
            parameters: Vec::new(),
            columns: Vec::new(),
            formats: Vec::new(),
            cursor: Cursor::Pending,
        }
    }

    #[test]
    fn unnamed_statement_is_replaced() {
        let mut session = Session::new(SessionInfo::default());

        session.put_statement("".into(), statement("SELECT 1")).unwrap();
        session.put_statement("".into(), statement("SELECT 2")).unwrap();

        assert_eq!(session.statement("").unwrap().query, "SELECT 2");
    }

    #[test]
    fn named_statement_must_be_closed_first() {
        let mut session = Session::new(SessionInfo::default());
        session.put_statement("s".into(), statement("SELECT 1")).unwrap();

        let err = session
            .put_statement("s".into(), statement("SELECT 2"))
            .unwrap_err();
        assert_eq!(err.code, sql_state::DUPLICATE_PREPARED_STATEMENT);

        session.close_statement("s");
        session.put_statement("s".into(), statement("SELECT 2")).unwrap();
    }

    #[test]
    fn closing_a_statement_drops_its_portals() {
        let mut session = Session::new(SessionInfo::default());
        session.put_statement("s".into(), statement("SELECT 1")).unwrap();
        session.put_portal("p".into(), portal("s")).unwrap();
        session.put_portal("q".into(), portal("")).unwrap();

        session.close_statement("s");

        assert!(session.portal("p").is_err());
        assert!(session.portal("q").is_ok());
    }

    #[test]
    fn missing_objects_have_their_own_codes() {
        let session = Session::new(SessionInfo::default());

        assert_eq!(
            session.statement("nope").unwrap_err().code,
            sql_state::INVALID_SQL_STATEMENT_NAME
        );
        assert_eq!(
            session.portal("nope").unwrap_err().code,
            sql_state::INVALID_CURSOR_NAME
        );
    }

    #[test]
    fn failure_only_sticks_inside_a_transaction() {
        let mut session = Session::new(SessionInfo::default());

        session.fail();
        assert_eq!(session.status(), TransactionStatus::Idle);

        session.apply(&CommandTag::new("BEGIN"));
        session.fail();
        assert_eq!(session.status(), TransactionStatus::Failed);

        session.apply(&CommandTag::new("ROLLBACK"));
        assert_eq!(session.status(), TransactionStatus::Idle);
    }

    #[test]
    fn sync_clears_discard_and_implicit_portals() {
        let mut session = Session::new(SessionInfo::default());
        session.put_portal("".into(), portal("")).unwrap();
        session.begin_discard();

        assert_eq!(session.sync(), TransactionStatus::Idle);
        assert!(!session.is_discarding());
        assert!(session.portal("").is_err());
    }

    #[test]
    fn sync_keeps_portals_of_open_transaction() {
        let mut session = Session::new(SessionInfo::default());
        session.apply(&CommandTag::new("BEGIN"));
        session.put_portal("p".into(), portal("")).unwrap();

        assert_eq!(session.sync(), TransactionStatus::InTransaction);
        assert!(session.portal("p").is_ok());
    }

    #[test]
    fn failed_transaction_only_admits_its_end() {
        let mut session = Session::new(SessionInfo::default());
        session.apply(&CommandTag::new("BEGIN"));
        assert_eq!(session.admit("SELECT 1").unwrap(), "SELECT 1");

        session.fail();

        assert_eq!(
            session.admit("SELECT 1").unwrap_err().code,
            sql_state::IN_FAILED_SQL_TRANSACTION
        );
        assert_eq!(session.admit("COMMIT").unwrap(), "ROLLBACK");
        assert_eq!(session.admit("abort;").unwrap(), "ROLLBACK");
    }

    #[test]
    fn transaction_enders_are_recognised() {
        assert!(ends_transaction("rollback;"));
        assert!(ends_transaction("  COMMIT"));
        assert!(ends_transaction("end"));
        assert!(!ends_transaction("SELECT 1"));
        assert!(!ends_transaction("committed"));
    }

    #[test]
    fn transaction_end_keywords_ignore_case() {
        assert_eq!(TransactionEnd::from_str("RollBack"), Ok(TransactionEnd::Rollback));
        assert_eq!(
            TransactionEnd::from_str("BEGIN"),
            Err(strum::ParseError::VariantNotFound)
        );
    }
}
