pub mod caller;
pub mod crypto;
pub mod db;
pub mod model;
pub mod sweep;
pub mod users;

pub use caller::{Caller, Waiting};
pub use crypto::{Cipher, DecryptionError};
pub use db::{PutResult, Store, TakeResult};
pub use model::{Lifetime, Page, PageRequest, SecretMeta, SecretRecord};
pub use sweep::SweepReport;
pub use users::{UserRecord, UserWrite};
