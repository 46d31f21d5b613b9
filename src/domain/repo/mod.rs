mod model;
mod repository;

pub use model::Repo;
pub use repository::{RepoRepository, SqliteRepoRepository};
