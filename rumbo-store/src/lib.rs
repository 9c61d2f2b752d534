pub mod app_config;
pub mod database;
pub mod events;
pub mod history_repo;
pub mod ledger;
pub mod memory;
pub mod reservation_repo;
pub mod trip_repo;
pub mod violation_repo;

pub use database::DbClient;
pub use events::{BroadcastNotificationSink, RecordingNotificationSink};
pub use history_repo::PgHistoryStore;
pub use ledger::PgReservationLedger;
pub use memory::MemoryStore;
pub use reservation_repo::PgReservationStore;
pub use trip_repo::PgTripStore;
pub use violation_repo::PgViolationStore;
