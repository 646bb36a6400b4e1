mod redis_store;
mod schema;

pub use redis_store::RedisStore;
pub use schema::*;
