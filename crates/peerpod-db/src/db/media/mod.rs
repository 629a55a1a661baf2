pub mod job;
pub mod record;

pub use job::JobRepository;
