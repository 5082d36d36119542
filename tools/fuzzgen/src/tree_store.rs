use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::codec::{RawValue, TypeTag};
use crate::errors::FuzzError;
use crate::tree::{DecisionSignature, ExecutionTree, Node};

type StoreResult<T> = Result<T, FuzzError>;

const MIGRATIONS: [(i64, &str); 1] = [(
    1,
    "CREATE TABLE IF NOT EXISTS tree_nodes (
        node_id INTEGER PRIMARY KEY,
        parent_id INTEGER REFERENCES tree_nodes(node_id),
        decision_id INTEGER,
        tag INTEGER,
        bits INTEGER,
        outcome INTEGER,
        may_win INTEGER NOT NULL DEFAULT 0,
        claim_decision_id INTEGER,
        claim_tag INTEGER,
        claim_lo INTEGER,
        claim_hi INTEGER
    );
    CREATE TABLE IF NOT EXISTS tree_snapshots (
        snapshot_id INTEGER PRIMARY KEY AUTOINCREMENT,
        taken_at INTEGER NOT NULL,
        node_count INTEGER NOT NULL
    );",
)];

/// Row shape shared by `save` and `load`.
struct NodeRow {
    node_id: i64,
    parent_id: Option<i64>,
    edge: Option<(u64, RawValue)>,
    outcome: Option<bool>,
    may_win: bool,
    claim: Option<DecisionSignature>,
}

/// SQLite snapshot of an [`ExecutionTree`].
pub struct TreeStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl TreeStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| FuzzError::Database(e.to_string()))?;
        }

        let existed_before_open = path.exists();
        if existed_before_open {
            let meta =
                std::fs::metadata(&path).map_err(|e| FuzzError::Database(e.to_string()))?;
            if meta.len() == 0 {
                return Err(FuzzError::Database(format!(
                    "tree database is 0 bytes (corrupt): {}",
                    path.display()
                )));
            }
        }

        let mut conn = Connection::open(&path).map_err(db_err)?;
        configure_connection(&conn)?;

        if existed_before_open {
            let integrity: String = conn
                .pragma_query_value(None, "quick_check", |row| row.get(0))
                .map_err(db_err)?;
            if integrity != "ok" {
                return Err(FuzzError::Database(format!(
                    "tree database failed integrity check: {integrity}"
                )));
            }
        }

        run_migrations(&mut conn)?;
        info!(path = %path.display(), "tree store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Replaces the stored tree with `tree`. Returns the number of nodes written.
    pub fn save(&self, tree: &ExecutionTree) -> StoreResult<usize> {
        let rows = collect_rows(tree);
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute("DELETE FROM tree_nodes", []).map_err(db_err)?;
        {
            let mut insert = tx
                .prepare(
                    "INSERT INTO tree_nodes(node_id, parent_id, decision_id, tag, bits, outcome,
                        may_win, claim_decision_id, claim_tag, claim_lo, claim_hi)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                )
                .map_err(db_err)?;
            for row in &rows {
                insert
                    .execute(params![
                        row.node_id,
                        row.parent_id,
                        row.edge.map(|(id, _)| id as i64),
                        row.edge.map(|(_, v)| i64::from(v.tag.as_u8())),
                        row.edge.map(|(_, v)| v.bits as i64),
                        row.outcome,
                        row.may_win,
                        row.claim.map(|c| c.decision_id as i64),
                        row.claim.map(|c| i64::from(c.tag.as_u8())),
                        row.claim.map(|c| c.lo.bits as i64),
                        row.claim.map(|c| c.hi.bits as i64),
                    ])
                    .map_err(db_err)?;
            }
        }
        tx.execute(
            "INSERT INTO tree_snapshots(taken_at, node_count) VALUES (?1, ?2)",
            params![system_time_unix(), rows.len() as i64],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        debug!(nodes = rows.len(), "tree snapshot saved");
        Ok(rows.len())
    }

    /// Rebuilds the stored tree. An empty store yields a fresh tree.
    pub fn load(&self) -> StoreResult<ExecutionTree> {
        let rows = {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT node_id, parent_id, decision_id, tag, bits, outcome, may_win,
                        claim_decision_id, claim_tag, claim_lo, claim_hi
                     FROM tree_nodes ORDER BY node_id",
                )
                .map_err(db_err)?;
            let mapped = stmt.query_map([], row_to_node).map_err(db_err)?;
            mapped
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?
        };

        let tree = ExecutionTree::new();
        let mut by_id: HashMap<i64, Arc<Node>> = HashMap::new();
        for row in rows {
            let row = row?;
            let node = match (row.parent_id, row.edge) {
                (None, _) => tree.root(),
                (Some(parent_id), Some((decision_id, value))) => {
                    let parent = by_id.get(&parent_id).ok_or_else(|| {
                        FuzzError::Database(format!(
                            "node {} references missing parent {parent_id}",
                            row.node_id
                        ))
                    })?;
                    tree.advance(parent, decision_id, value)
                }
                (Some(_), None) => {
                    return Err(FuzzError::Database(format!(
                        "node {} has a parent but no edge",
                        row.node_id
                    )))
                }
            };
            tree.restore_labels(&node, row.outcome, row.may_win, row.claim);
            by_id.insert(row.node_id, node);
        }
        Ok(tree)
    }

    pub fn snapshot_count(&self) -> StoreResult<u64> {
        let conn = self.lock()?;
        let count: Option<i64> = conn
            .query_row("SELECT COUNT(*) FROM tree_snapshots", [], |row| row.get(0))
            .optional()
            .map_err(db_err)?;
        Ok(count.unwrap_or(0) as u64)
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| FuzzError::Database("tree store lock poisoned".to_string()))
    }
}

/// Pre-order rows; parents always precede their children.
fn collect_rows(tree: &ExecutionTree) -> Vec<NodeRow> {
    let mut rows = Vec::with_capacity(tree.node_count());
    let mut stack: Vec<(Arc<Node>, Option<i64>)> = vec![(tree.root(), None)];
    while let Some((node, parent_id)) = stack.pop() {
        let node_id = rows.len() as i64;
        rows.push(NodeRow {
            node_id,
            parent_id,
            edge: node.key().map(|key| (key.decision_id, key.value)),
            outcome: node.outcome(),
            may_win: node.may_win(),
            claim: node.decision(),
        });
        for child in node.children().into_iter().rev() {
            stack.push((child, Some(node_id)));
        }
    }
    rows
}

fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoreResult<NodeRow>> {
    let node_id: i64 = row.get(0)?;
    let parent_id: Option<i64> = row.get(1)?;
    let decision_id: Option<i64> = row.get(2)?;
    let tag: Option<i64> = row.get(3)?;
    let bits: Option<i64> = row.get(4)?;
    let outcome: Option<bool> = row.get(5)?;
    let may_win: bool = row.get(6)?;
    let claim_id: Option<i64> = row.get(7)?;
    let claim_tag: Option<i64> = row.get(8)?;
    let claim_lo: Option<i64> = row.get(9)?;
    let claim_hi: Option<i64> = row.get(10)?;

    let parse = || -> StoreResult<NodeRow> {
        let edge = match (decision_id, tag, bits) {
            (Some(id), Some(tag), Some(bits)) => Some((
                id as u64,
                RawValue {
                    tag: tag_from_db(tag)?,
                    bits: bits as u64,
                },
            )),
            _ => None,
        };
        let claim = match (claim_id, claim_tag, claim_lo, claim_hi) {
            (Some(id), Some(tag), Some(lo), Some(hi)) => {
                let tag = tag_from_db(tag)?;
                Some(DecisionSignature {
                    decision_id: id as u64,
                    tag,
                    lo: RawValue {
                        tag,
                        bits: lo as u64,
                    },
                    hi: RawValue {
                        tag,
                        bits: hi as u64,
                    },
                })
            }
            _ => None,
        };
        Ok(NodeRow {
            node_id,
            parent_id,
            edge,
            outcome,
            may_win,
            claim,
        })
    };
    Ok(parse())
}

fn tag_from_db(value: i64) -> StoreResult<TypeTag> {
    u8::try_from(value)
        .ok()
        .and_then(TypeTag::from_u8)
        .ok_or_else(|| FuzzError::Database(format!("invalid type tag in store: {value}")))
}

fn configure_connection(conn: &Connection) -> StoreResult<()> {
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(db_err)?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(db_err)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(db_err)?;
    Ok(())
}

fn run_migrations(conn: &mut Connection) -> StoreResult<()> {
    conn.execute_batch("BEGIN IMMEDIATE; CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY, applied_at INTEGER NOT NULL); COMMIT;")
        .map_err(db_err)?;

    for (version, sql) in MIGRATIONS {
        let exists = conn
            .query_row(
                "SELECT 1 FROM schema_migrations WHERE version = ?1 LIMIT 1",
                [version],
                |_| Ok(()),
            )
            .optional()
            .map_err(db_err)?
            .is_some();

        if exists {
            continue;
        }

        debug!(version, "applying tree store migration");
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute_batch(sql).map_err(db_err)?;
        tx.execute(
            "INSERT INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![version, system_time_unix()],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
    }

    Ok(())
}

fn db_err(error: rusqlite::Error) -> FuzzError {
    FuzzError::Database(error.to_string())
}

pub fn system_time_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
