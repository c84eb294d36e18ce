use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;

#[derive(Clone, Copy)]
enum SqlScan {
    Plain,
    SingleQuote,
    LineComment,
    DollarQuote,
}

/// Split a schema file into executable statements. A character scanner tracks
/// whether the current `;` sits in plain text, a quoted literal, a line
/// comment, or a $$-quoted body; only plain-text semicolons terminate a
/// statement, and comment text never reaches the output.
fn split_sql_statements(input: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut mode = SqlScan::Plain;
    let mut chars = input.chars().peekable();

    let flush = |cur: &mut String, out: &mut Vec<String>| {
        let stmt = cur.trim();
        if !stmt.is_empty() {
            out.push(stmt.to_string());
        }
        cur.clear();
    };

    while let Some(ch) = chars.next() {
        match mode {
            SqlScan::Plain => match ch {
                '-' if chars.peek() == Some(&'-') => {
                    chars.next();
                    mode = SqlScan::LineComment;
                }
                '$' if chars.peek() == Some(&'$') => {
                    chars.next();
                    cur.push_str("$$");
                    mode = SqlScan::DollarQuote;
                }
                '\'' => {
                    cur.push(ch);
                    mode = SqlScan::SingleQuote;
                }
                ';' => flush(&mut cur, &mut out),
                _ => cur.push(ch),
            },
            SqlScan::SingleQuote => {
                cur.push(ch);
                if ch == '\'' {
                    mode = SqlScan::Plain;
                }
            }
            SqlScan::LineComment => {
                if ch == '\n' {
                    cur.push('\n');
                    mode = SqlScan::Plain;
                }
            }
            SqlScan::DollarQuote => {
                if ch == '$' && chars.peek() == Some(&'$') {
                    chars.next();
                    cur.push_str("$$");
                    mode = SqlScan::Plain;
                } else {
                    cur.push(ch);
                }
            }
        }
    }
    flush(&mut cur, &mut out);
    out
}

#[tokio::main]
async fn main() -> Result<()> {
    let db_url = std::env::var("DATABASE_URL").context("missing required env var: DATABASE_URL")?;
    let schema_path = std::env::var("SCHEMA_PATH").unwrap_or_else(|_| "schema.sql".to_string());
    let hard_reset = std::env::var("DB_HARD_RESET")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let db = PgPoolOptions::new()
        .max_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&db_url)
        .await
        .context("connect postgres")?;

    if hard_reset {
        // Clean slate for dev databases; the configured role must own the schema.
        sqlx::query("DROP SCHEMA IF EXISTS public CASCADE")
            .execute(&db)
            .await
            .context("drop public schema")?;
        sqlx::query("CREATE SCHEMA public")
            .execute(&db)
            .await
            .context("create public schema")?;
    }

    let schema_sql = fs::read_to_string(&schema_path)
        .with_context(|| format!("read schema file: {schema_path}"))?;
    let statements = split_sql_statements(&schema_sql);
    for stmt in &statements {
        sqlx::query(stmt)
            .execute(&db)
            .await
            .with_context(|| format!("exec schema stmt: {}", stmt.lines().next().unwrap_or("<empty>")))?;
    }

    println!("initialized: statements={} hard_reset={}", statements.len(), hard_reset);
    Ok(())
}
