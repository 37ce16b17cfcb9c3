use crate::db::Database;
use crate::errors::AppResult;
use uuid::Uuid;

const INSTALL_ID_KEY: &str = "install_id";

/// Returns the stable install identifier, minting one on first use.
pub fn install_id(db: &Database) -> AppResult<String> {
    if let Some(existing) = db.kv_get(INSTALL_ID_KEY)? {
        if !existing.trim().is_empty() {
            return Ok(existing);
        }
    }

    let minted = Uuid::new_v4().to_string();
    db.kv_set(INSTALL_ID_KEY, &minted)?;
    tracing::info!(install_id = %minted, "install id created");
    Ok(minted)
}

#[cfg(test)]
mod tests {
    use super::{install_id, INSTALL_ID_KEY};
    use crate::db::Database;

    #[test]
    fn install_id_is_stable_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("install.db");
        let first = {
            let db = Database::new(&path).expect("db");
            install_id(&db).expect("id")
        };
        let db = Database::new(&path).expect("reopen");
        assert_eq!(install_id(&db).expect("id"), first);
        assert!(uuid::Uuid::parse_str(&first).is_ok());
    }

    #[test]
    fn blank_value_is_replaced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("install.db")).expect("db");
        db.kv_set(INSTALL_ID_KEY, "  ").expect("seed");
        let id = install_id(&db).expect("id");
        assert!(!id.trim().is_empty());
        assert_eq!(db.kv_get(INSTALL_ID_KEY).expect("read"), Some(id));
    }
}
