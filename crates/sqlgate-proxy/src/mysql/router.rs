//! Statement classification and pool selection.
//!
//! Only the leading keyword is inspected (after whitespace and comments).
//! Anything not recognised as a plain read goes to the admin pool.

/// Which backend pool serves a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Admin,
    Readonly,
}

impl Route {
    pub fn as_str(self) -> &'static str {
        match self {
            Route::Admin => "admin",
            Route::Readonly => "readonly",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// Side-effect free and connection-independent.
    Read,
    Write,
    Begin,
    /// `COMMIT` or `ROLLBACK`.
    End,
    /// `USE <db>`, answered by the proxy itself.
    Use(String),
}

/// Reads that lock rows or depend on per-connection state.
const PINNED_READ_MARKERS: &[&str] = &[
    "FOR UPDATE",
    "LOCK IN SHARE MODE",
    "FOR SHARE",
    " INTO ",
    "LAST_INSERT_ID",
    "FOUND_ROWS",
    "ROW_COUNT",
    "GET_LOCK",
    "RELEASE_LOCK",
    "@",
];

pub fn classify(sql: &str) -> Statement {
    let body = skip_leading_noise(sql);
    let keyword = first_word(body);
    match keyword.to_ascii_uppercase().as_str() {
        "SELECT" => {
            let upper = body.to_ascii_uppercase();
            if PINNED_READ_MARKERS.iter().any(|m| upper.contains(m)) {
                Statement::Write
            } else {
                Statement::Read
            }
        }
        "SHOW" | "DESC" | "DESCRIBE" | "EXPLAIN" => Statement::Read,
        "BEGIN" => Statement::Begin,
        "START" => {
            let rest = skip_leading_noise(&body[keyword.len()..]);
            if first_word(rest).eq_ignore_ascii_case("TRANSACTION") {
                Statement::Begin
            } else {
                Statement::Write
            }
        }
        "COMMIT" => Statement::End,
        "ROLLBACK" => {
            // ROLLBACK TO SAVEPOINT keeps the transaction open.
            let rest = skip_leading_noise(&body[keyword.len()..]);
            if first_word(rest).eq_ignore_ascii_case("TO") {
                Statement::Write
            } else {
                Statement::End
            }
        }
        "USE" => {
            let db = body[keyword.len()..]
                .trim()
                .trim_end_matches(';')
                .trim()
                .trim_matches('`');
            if db.is_empty() {
                Statement::Write
            } else {
                Statement::Use(db.to_string())
            }
        }
        _ => Statement::Write,
    }
}

/// Reads go to the readonly pool unless the session is pinned to admin
/// (open transaction or autocommit off).
pub fn route(statement: &Statement, pinned: bool) -> Route {
    match statement {
        Statement::Read if !pinned => Route::Readonly,
        _ => Route::Admin,
    }
}

fn skip_leading_noise(mut sql: &str) -> &str {
    loop {
        sql = sql.trim_start();
        if let Some(rest) = sql.strip_prefix("/*") {
            // `/*! ... */` is executed by MySQL; leave it for the backend.
            if rest.starts_with('!') {
                return sql;
            }
            match rest.find("*/") {
                Some(end) => sql = &rest[end + 2..],
                None => return "",
            }
        } else if sql.starts_with("--") || sql.starts_with('#') {
            match sql.find('\n') {
                Some(end) => sql = &sql[end + 1..],
                None => return "",
            }
        } else {
            return sql;
        }
    }
}

fn first_word(sql: &str) -> &str {
    let end = sql
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(sql.len());
    &sql[..end]
}
