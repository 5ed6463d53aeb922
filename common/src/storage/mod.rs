pub mod db;
pub mod indexes;
pub mod pool;
pub mod types;
pub mod vector_store;
