use anyhow::Result;
use rusqlite::Connection;
use serde_json::Value;

pub const DEFAULT_DB_PATH: &str = "data/screener.sqlite";

pub fn connect(path: &str) -> Result<Connection> {
    if let Some(dir) = std::path::Path::new(path).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS symbols (
            symbol     TEXT PRIMARY KEY,
            added_at   TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- One merged document per (symbol, dataset); re-scrapes replace it.
        CREATE TABLE IF NOT EXISTS stock_documents (
            symbol     TEXT NOT NULL,
            dataset    TEXT NOT NULL,
            document   TEXT NOT NULL,
            scraped_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (symbol, dataset)
        );
        CREATE INDEX IF NOT EXISTS idx_documents_dataset ON stock_documents(dataset);
        ",
    )?;
    Ok(())
}

// ── Symbol catalog ──

pub fn import_symbols(conn: &Connection, symbols: &[String]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let mut count = 0;
    {
        let mut stmt = tx.prepare("INSERT OR IGNORE INTO symbols (symbol) VALUES (?1)")?;
        for symbol in symbols {
            count += stmt.execute(rusqlite::params![symbol])?;
        }
    }
    tx.commit()?;
    Ok(count)
}

pub fn list_symbols(conn: &Connection, limit: Option<usize>) -> Result<Vec<String>> {
    let sql = match limit {
        Some(n) => format!("SELECT symbol FROM symbols ORDER BY symbol LIMIT {}", n),
        None => "SELECT symbol FROM symbols ORDER BY symbol".to_string(),
    };
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Documents ──

/// Insert-or-replace keyed by (symbol, dataset): repeated runs are
/// idempotent and last-write-wins at document granularity. Returns the
/// stored document's identity.
pub fn upsert_document(
    conn: &Connection,
    symbol: &str,
    dataset: &str,
    document: &Value,
) -> Result<String> {
    conn.execute(
        "INSERT INTO stock_documents (symbol, dataset, document)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(symbol, dataset)
         DO UPDATE SET document = excluded.document, scraped_at = datetime('now')",
        rusqlite::params![symbol, dataset, serde_json::to_string(document)?],
    )?;
    Ok(format!("{}/{}", dataset, symbol))
}

pub fn fetch_document(conn: &Connection, symbol: &str, dataset: &str) -> Result<Option<String>> {
    let mut stmt =
        conn.prepare("SELECT document FROM stock_documents WHERE symbol = ?1 AND dataset = ?2")?;
    let mut rows = stmt.query(rusqlite::params![symbol, dataset])?;
    match rows.next()? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

pub fn count_documents(conn: &Connection, dataset: &str) -> Result<usize> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM stock_documents WHERE dataset = ?1",
        rusqlite::params![dataset],
        |r| r.get(0),
    )?;
    Ok(count)
}

// ── Stats ──

pub struct Stats {
    pub symbols: usize,
    pub documents: usize,
    pub datasets: usize,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let symbols: usize = conn.query_row("SELECT COUNT(*) FROM symbols", [], |r| r.get(0))?;
    let documents: usize =
        conn.query_row("SELECT COUNT(*) FROM stock_documents", [], |r| r.get(0))?;
    let datasets: usize = conn.query_row(
        "SELECT COUNT(DISTINCT dataset) FROM stock_documents",
        [],
        |r| r.get(0),
    )?;
    Ok(Stats {
        symbols,
        documents,
        datasets,
    })
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn upsert_is_idempotent_and_last_write_wins() {
        let conn = test_conn();
        let doc_a = serde_json::json!({"symbol": "TCS", "stock_details": {"P/E": "24.3"}});
        let doc_b = serde_json::json!({"symbol": "TCS", "stock_details": {"P/E": "25.0"}});

        let id1 = upsert_document(&conn, "TCS", "fundamentals", &doc_a).unwrap();
        let id2 = upsert_document(&conn, "TCS", "fundamentals", &doc_b).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(count_documents(&conn, "fundamentals").unwrap(), 1);

        let stored = fetch_document(&conn, "TCS", "fundamentals")
            .unwrap()
            .unwrap();
        assert_eq!(stored, serde_json::to_string(&doc_b).unwrap());
    }

    #[test]
    fn datasets_are_distinct_keys() {
        let conn = test_conn();
        let doc = serde_json::json!({"symbol": "TCS"});
        upsert_document(&conn, "TCS", "fundamentals", &doc).unwrap();
        upsert_document(&conn, "TCS", "peers_only", &doc).unwrap();
        assert_eq!(count_documents(&conn, "fundamentals").unwrap(), 1);
        assert_eq!(get_stats(&conn).unwrap().datasets, 2);
    }

    #[test]
    fn symbol_import_ignores_duplicates() {
        let conn = test_conn();
        let n = import_symbols(&conn, &["TCS".into(), "INFY".into(), "TCS".into()]).unwrap();
        assert_eq!(n, 2);
        assert_eq!(list_symbols(&conn, None).unwrap(), vec!["INFY", "TCS"]);
    }
}
