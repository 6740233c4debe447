//! Sessions and the transaction façade
//!
//! A session hosts at most one active transaction. The default session
//! backs the plain `start_transaction`/`commit_transaction` API; explicit
//! sessions get the `_in` variants.

use serde_json::Value;
use tracing::debug;

use crate::config::TransactionOptions;
use crate::error::{DbError, Result};
use crate::txn::manager::{ChangeListener, ListenerId, SavepointInfo};
use crate::txn::transaction::TxId;

use super::core::Database;

/// Opaque session handle
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(pub(crate) String);

impl SessionId {
    pub(crate) fn default_session() -> Self {
        SessionId("session_default".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Database {
    /// Open a new session.
    pub fn start_session(&self) -> SessionId {
        let seq = self
            .session_seq
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let id = SessionId(format!("session_{}", seq));
        self.sessions.write().insert(id.clone(), None);
        debug!(session = %id.0, "session started");
        id
    }

    /// Close a session, rolling back its active transaction if any.
    pub fn end_session(&self, session: &SessionId) -> Result<()> {
        let tx = self.sessions.write().remove(session).flatten();
        if let Some(tx) = tx {
            self.manager()?.rollback(&tx)?;
        }
        Ok(())
    }

    fn default_id(&self) -> SessionId {
        SessionId::default_session()
    }

    fn session_tx(&self, session: &SessionId) -> Result<Option<TxId>> {
        let sessions = self.sessions.read();
        let slot = sessions
            .get(session)
            .ok_or_else(|| DbError::TransactionState(format!("unknown session '{}'", session.0)))?;
        Ok(slot.clone())
    }

    /// Begin a transaction in a session. A session hosts one active
    /// transaction at a time; nested begins are an error.
    pub fn start_transaction_in(
        &self,
        session: &SessionId,
        options: TransactionOptions,
    ) -> Result<TxId> {
        let manager = self.manager()?;
        if let Some(existing) = self.session_tx(session)? {
            if manager.is_active(&existing) {
                return Err(DbError::TransactionState(format!(
                    "session '{}' already has active transaction '{}'",
                    session.0, existing
                )));
            }
        }
        let tx = manager.begin(options)?;
        self.sessions
            .write()
            .insert(session.clone(), Some(tx.clone()));
        Ok(tx)
    }

    pub fn start_transaction(&self, options: TransactionOptions) -> Result<TxId> {
        self.start_transaction_in(&self.default_id(), options)
    }

    fn take_current(&self, session: &SessionId) -> Result<TxId> {
        let tx = self.session_tx(session)?.ok_or_else(|| {
            DbError::TransactionState(format!(
                "session '{}' has no active transaction",
                session.0
            ))
        })?;
        Ok(tx)
    }

    pub fn commit_transaction_in(&self, session: &SessionId) -> Result<()> {
        let tx = self.take_current(session)?;
        let result = self.manager()?.commit(&tx);
        self.sessions.write().insert(session.clone(), None);
        result
    }

    pub fn commit_transaction(&self) -> Result<()> {
        self.commit_transaction_in(&self.default_id())
    }

    pub fn abort_transaction_in(&self, session: &SessionId) -> Result<()> {
        let tx = self.take_current(session)?;
        let result = self.manager()?.rollback(&tx);
        self.sessions.write().insert(session.clone(), None);
        result
    }

    pub fn abort_transaction(&self) -> Result<()> {
        self.abort_transaction_in(&self.default_id())
    }

    /// The session's current transaction id, if still active.
    pub fn get_current_transaction_id_in(&self, session: &SessionId) -> Option<TxId> {
        let tx = self.session_tx(session).ok().flatten()?;
        let manager = self.manager.as_ref()?;
        if manager.is_active(&tx) {
            Some(tx)
        } else {
            None
        }
    }

    pub fn get_current_transaction_id(&self) -> Option<TxId> {
        self.get_current_transaction_id_in(&self.default_id())
    }

    pub fn active_transaction_count(&self) -> usize {
        self.manager
            .as_ref()
            .map(|m| m.stats().active_transactions)
            .unwrap_or(0)
    }

    /// Sweep timed-out transactions.
    pub fn cleanup_transactions(&self) -> Result<usize> {
        self.manager()?.cleanup()
    }

    // ---- savepoints on the default session's transaction ----

    pub fn create_savepoint(&self, name: &str) -> Result<String> {
        let tx = self.take_current(&self.default_id())?;
        self.manager()?.create_savepoint(&tx, name)
    }

    pub fn rollback_to_savepoint(&self, savepoint_id: &str) -> Result<()> {
        let tx = self.take_current(&self.default_id())?;
        self.manager()?.rollback_to_savepoint(&tx, savepoint_id)
    }

    pub fn release_savepoint(&self, savepoint_id: &str) -> Result<()> {
        let tx = self.take_current(&self.default_id())?;
        self.manager()?.release_savepoint(&tx, savepoint_id)
    }

    pub fn list_savepoints(&self) -> Result<Vec<SavepointInfo>> {
        let tx = self.take_current(&self.default_id())?;
        self.manager()?.list_savepoints(&tx)
    }

    // ---- change listeners ----

    pub fn add_change_listener(&self, listener: ChangeListener) -> Result<ListenerId> {
        Ok(self.manager()?.add_change_listener(listener))
    }

    pub fn remove_change_listener(&self, id: ListenerId) -> Result<()> {
        self.manager()?.remove_change_listener(id);
        Ok(())
    }

    // ---- transaction-aware mutation routing ----

    /// Insert into a collection through the session's transaction when
    /// one is active, directly otherwise.
    pub fn insert(&self, collection: &str, record: Value) -> Result<Value> {
        let c = self.collection(collection)?;
        match self.get_current_transaction_id() {
            Some(tx) => c.create_tx(&tx, record),
            None => c.create(record),
        }
    }

    pub fn update(
        &self,
        collection: &str,
        id: &Value,
        patch: &Value,
        merge: bool,
    ) -> Result<Option<Value>> {
        let c = self.collection(collection)?;
        match self.get_current_transaction_id() {
            Some(tx) => c.update_tx(&tx, id, patch, merge),
            None => c.update_by_id(id, patch, merge),
        }
    }

    pub fn remove(&self, collection: &str, id: &Value) -> Result<Option<Value>> {
        let c = self.collection(collection)?;
        match self.get_current_transaction_id() {
            Some(tx) => c.remove_tx(&tx, id),
            None => c.remove_by_id(id),
        }
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseOptions;
    use serde_json::json;

    fn tx_db() -> Database {
        let mut options = DatabaseOptions::in_memory();
        options.enable_transactions = true;
        let db = Database::new(options).unwrap();
        db.connect().unwrap();
        db.create_collection("users").unwrap();
        db
    }

    #[test]
    fn test_session_transaction_lifecycle() {
        let db = tx_db();
        assert!(db.get_current_transaction_id().is_none());

        let tx = db.start_transaction(TransactionOptions::default()).unwrap();
        assert_eq!(db.get_current_transaction_id(), Some(tx.clone()));
        assert_eq!(db.active_transaction_count(), 1);

        // nested begin on the same session is rejected
        assert!(db.start_transaction(TransactionOptions::default()).is_err());

        db.insert("users", json!({"id": 1, "name": "ann"})).unwrap();
        assert!(db
            .collection("users")
            .unwrap()
            .find_by_id(&json!(1))
            .unwrap()
            .is_none());

        db.commit_transaction().unwrap();
        assert!(db.get_current_transaction_id().is_none());
        assert!(db
            .collection("users")
            .unwrap()
            .find_by_id(&json!(1))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_abort_discards_session_changes() {
        let db = tx_db();
        db.start_transaction(TransactionOptions::default()).unwrap();
        db.insert("users", json!({"id": 1})).unwrap();
        db.abort_transaction().unwrap();
        assert_eq!(db.collection("users").unwrap().len(), 0);
        // commit without an active transaction is a state error
        assert!(matches!(
            db.commit_transaction().unwrap_err(),
            DbError::TransactionState(_)
        ));
    }

    #[test]
    fn test_two_sessions_independent_transactions() {
        let db = tx_db();
        let s1 = db.start_session();
        let s2 = db.start_session();

        let t1 = db
            .start_transaction_in(&s1, TransactionOptions::default())
            .unwrap();
        let t2 = db
            .start_transaction_in(&s2, TransactionOptions::default())
            .unwrap();
        assert_ne!(t1, t2);
        assert_eq!(db.active_transaction_count(), 2);

        db.commit_transaction_in(&s1).unwrap();
        assert_eq!(db.active_transaction_count(), 1);

        // ending a session rolls back its open transaction
        db.end_session(&s2).unwrap();
        assert_eq!(db.active_transaction_count(), 0);
    }

    #[test]
    fn test_routing_without_transaction() {
        let db = tx_db();
        db.insert("users", json!({"id": 7, "v": 1})).unwrap();
        assert_eq!(db.collection("users").unwrap().len(), 1);
        db.update("users", &json!(7), &json!({"v": 2}), true).unwrap();
        assert_eq!(
            db.collection("users")
                .unwrap()
                .find_by_id(&json!(7))
                .unwrap()
                .unwrap()["v"],
            2
        );
        db.remove("users", &json!(7)).unwrap();
        assert_eq!(db.collection("users").unwrap().len(), 0);
    }

    #[test]
    fn test_savepoints_via_database_api() {
        let db = tx_db();
        db.start_transaction(TransactionOptions::default()).unwrap();
        db.insert("users", json!({"id": 10, "v": "first"})).unwrap();

        let sp = db.create_savepoint("A").unwrap();
        db.insert("users", json!({"id": 11})).unwrap();
        db.update("users", &json!(10), &json!({"v": "second"}), true)
            .unwrap();
        assert_eq!(db.list_savepoints().unwrap().len(), 1);

        db.rollback_to_savepoint(&sp).unwrap();
        assert!(db.list_savepoints().unwrap().is_empty());

        db.commit_transaction().unwrap();
        let users = db.collection("users").unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(
            users.find_by_id(&json!(10)).unwrap().unwrap()["v"],
            "first"
        );
        assert!(users.find_by_id(&json!(11)).unwrap().is_none());
    }

    #[test]
    fn test_change_listener_through_database() {
        use parking_lot::Mutex;
        use std::sync::Arc;

        let db = tx_db();
        let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        db.add_change_listener(Box::new(move |_tx, changes| {
            seen_clone.lock().push(changes.len());
        }))
        .unwrap();

        db.start_transaction(TransactionOptions::default()).unwrap();
        db.insert("users", json!({"id": 1})).unwrap();
        db.insert("users", json!({"id": 2})).unwrap();
        db.commit_transaction().unwrap();

        db.start_transaction(TransactionOptions::default()).unwrap();
        db.insert("users", json!({"id": 3})).unwrap();
        db.abort_transaction().unwrap();

        assert_eq!(*seen.lock(), vec![2]);
    }

    #[test]
    fn test_transactions_disabled_error() {
        let db = Database::new(DatabaseOptions::in_memory()).unwrap();
        db.connect().unwrap();
        assert!(matches!(
            db.start_transaction(TransactionOptions::default())
                .unwrap_err(),
            DbError::TransactionState(_)
        ));
    }
}
