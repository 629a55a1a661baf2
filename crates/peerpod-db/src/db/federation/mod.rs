pub mod outbox;
pub mod pod;

pub use outbox::OutboxRepository;
pub use pod::PodRepository;
