pub mod local;

pub use local::{cosine_distance, LocalVectorStore};
