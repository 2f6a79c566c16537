#![allow(dead_code)]

use warden::{
    Backend, Entity, MemoryStore, Policy, Query, Record, Registry, StorageType, Value, Where,
    allows,
};

/// Users write posts in threads and comment on posts.
pub fn registry() -> Registry {
    Registry::new()
        .entity(
            Entity::new("user")
                .field("name", StorageType::String)
                .field("banned", StorageType::Boolean)
                .has_many("posts", "post", "author_id")
                .has_many("comments", "comment", "author_id"),
        )
        .entity(
            Entity::new("thread")
                .field("title", StorageType::String)
                .field("archived", StorageType::Boolean)
                .field("score", StorageType::Float)
                .has_many("posts", "post", "thread_id"),
        )
        .entity(
            Entity::new("post")
                .field("thread_id", StorageType::Integer)
                .field("author_id", StorageType::Integer)
                .field("hidden", StorageType::Boolean)
                .belongs_to("thread", "thread", "thread_id")
                .belongs_to("author", "user", "author_id")
                .has_many("comments", "comment", "post_id"),
        )
        .entity(
            Entity::new("comment")
                .field("post_id", StorageType::Integer)
                .field("author_id", StorageType::Integer)
                .field("body", StorageType::String)
                .field("hidden", StorageType::Boolean)
                .field("inserted_at", StorageType::Integer)
                .belongs_to("post", "post", "post_id")
                .belongs_to("author", "user", "author_id"),
        )
}

pub fn user(id: i64, name: &str, banned: bool) -> Record {
    Record::new("user")
        .with("id", id)
        .with("name", name)
        .with("banned", banned)
}

pub fn thread(id: i64, title: &str, archived: bool) -> Record {
    Record::new("thread")
        .with("id", id)
        .with("title", title)
        .with("archived", archived)
}

pub fn post(id: i64, thread_id: Option<i64>, author_id: i64, hidden: bool) -> Record {
    Record::new("post")
        .with("id", id)
        .with("thread_id", thread_id)
        .with("author_id", author_id)
        .with("hidden", hidden)
}

pub fn comment(id: i64, post_id: i64, author_id: i64, hidden: bool, inserted_at: i64) -> Record {
    Record::new("comment")
        .with("id", id)
        .with("post_id", post_id)
        .with("author_id", author_id)
        .with("body", format!("comment {id}"))
        .with("hidden", hidden)
        .with("inserted_at", inserted_at)
}

/// Threads 1 and 3 are open, thread 2 is archived. Post 11 is hidden and
/// post 14 has no thread. Comment 101 is hidden, comment 102 sits under the
/// archived thread and comment 104 under the hidden post.
pub fn store() -> MemoryStore {
    MemoryStore::new(registry())
        .with(user(1, "alice", false))
        .with(user(2, "bob", true))
        .with(user(3, "carol", false))
        .with(thread(1, "Welcome", false))
        .with(thread(2, "Old news", true))
        .with(thread(3, "Help", false))
        .with(post(10, Some(1), 1, false))
        .with(post(11, Some(1), 2, true))
        .with(post(12, Some(2), 1, false))
        .with(post(13, Some(3), 2, false))
        .with(post(14, None, 3, false))
        .with(comment(100, 10, 2, false, 10))
        .with(comment(101, 10, 1, true, 30))
        .with(comment(102, 12, 1, false, 20))
        .with(comment(103, 13, 1, false, 5))
        .with(comment(104, 11, 2, false, 40))
}

/// Readable threads are open ones, readable posts are visible posts in
/// readable threads, readable comments are visible comments on readable
/// posts.
pub fn forum_policy() -> Policy {
    Policy::new()
        .allow("read", "user", Where::new())
        .allow("read", "thread", Where::new().field("archived", false))
        .allow(
            "read",
            "post",
            Where::new()
                .field("hidden", false)
                .field("thread", allows("read")),
        )
        .allow(
            "read",
            "comment",
            Where::new()
                .field("hidden", false)
                .field("post", allows("read")),
        )
}

/// The stored record of `resource_type` with the given id.
pub fn find(store: &MemoryStore, resource_type: &str, id: i64) -> Record {
    store
        .rows(resource_type)
        .iter()
        .find(|record| record.get("id") == &Value::Integer(id))
        .cloned()
        .unwrap_or_else(|| panic!("no {resource_type} with id {id}"))
}

/// Ids of `records`, in order.
pub fn ids(records: &[Record]) -> Vec<i64> {
    records
        .iter()
        .filter_map(|record| match record.get("id") {
            Value::Integer(id) => Some(*id),
            _ => None,
        })
        .collect()
}

/// Ids of the rows `query` selects.
pub fn selected(store: &MemoryStore, query: &Query) -> Vec<i64> {
    ids(&store.all(query).expect("query runs against the store"))
}
