//! Query fan-outs to named collections

use serde_json::Value;

use crate::error::Result;

use super::core::Database;

impl Database {
    pub fn find_by_id(&self, collection: &str, id: &Value) -> Result<Option<Value>> {
        self.collection(collection)?.find_by_id(id)
    }

    pub fn find_by(&self, collection: &str, key: &str, value: &Value) -> Result<Vec<Value>> {
        self.collection(collection)?.find_by(key, value)
    }

    pub fn find_first_by(
        &self,
        collection: &str,
        key: &str,
        value: &Value,
    ) -> Result<Option<Value>> {
        self.collection(collection)?.find_first_by(key, value)
    }

    pub fn find_last_by(
        &self,
        collection: &str,
        key: &str,
        value: &Value,
    ) -> Result<Option<Value>> {
        self.collection(collection)?.find_last_by(key, value)
    }

    pub fn first(&self, collection: &str) -> Result<Option<Value>> {
        Ok(self.collection(collection)?.first())
    }

    pub fn last(&self, collection: &str) -> Result<Option<Value>> {
        Ok(self.collection(collection)?.last())
    }

    pub fn lowest(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        self.collection(collection)?.lowest(key)
    }

    pub fn greatest(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        self.collection(collection)?.greatest(key)
    }

    pub fn oldest(&self, collection: &str) -> Result<Option<Value>> {
        self.collection(collection)?.oldest()
    }

    pub fn latest(&self, collection: &str) -> Result<Option<Value>> {
        self.collection(collection)?.latest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseOptions, IndexDef};
    use serde_json::json;

    fn db_with_data() -> Database {
        let db = Database::new(DatabaseOptions::in_memory()).unwrap();
        db.connect().unwrap();
        db.create_collection("users").unwrap();
        db.create_index("users", "score", IndexDef::field("score")).unwrap();
        for (id, score) in [(1, 50), (2, 10), (3, 90)] {
            db.collection("users")
                .unwrap()
                .create(json!({"id": id, "score": score}))
                .unwrap();
        }
        db
    }

    #[test]
    fn test_fan_out_queries() {
        let db = db_with_data();
        assert_eq!(
            db.find_by_id("users", &json!(2)).unwrap().unwrap()["score"],
            10
        );
        assert_eq!(db.find_by("users", "score", &json!(50)).unwrap().len(), 1);
        assert_eq!(db.first("users").unwrap().unwrap()["id"], json!(1));
        assert_eq!(db.last("users").unwrap().unwrap()["id"], json!(3));
        assert_eq!(
            db.lowest("users", "score").unwrap().unwrap()["id"],
            json!(2)
        );
        assert_eq!(
            db.greatest("users", "score").unwrap().unwrap()["id"],
            json!(3)
        );
        // no TTL configured: oldest/latest follow insertion order
        assert_eq!(db.oldest("users").unwrap().unwrap()["id"], json!(1));
        assert_eq!(db.latest("users").unwrap().unwrap()["id"], json!(3));
    }

    #[test]
    fn test_fan_out_unknown_collection() {
        let db = db_with_data();
        assert!(db.find_by_id("ghost", &json!(1)).is_err());
    }
}
