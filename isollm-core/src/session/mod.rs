pub mod down;
pub mod record;
pub mod status;
pub mod up;

pub use down::{DownOptions, ShutdownChoice, ShutdownController, ShutdownOutcome, UnsavedWorker};
pub use record::{SessionRecord, SessionStore};
pub use status::{StatusCollector, StatusSnapshot};
pub use up::{SessionController, UpOptions};
