pub mod backend;
pub mod bus;
pub mod error;
pub mod keys;
pub mod reactive;
pub mod schema;
pub mod store;
pub mod window;

pub use backend::{Backend, FileBackend, STORE_FILE_NAME};
pub use bus::{Envelope, EventBus, LocalBus, Subscription};
pub use error::{BackendError, BusError, SchemaError, StoreError};
pub use keys::{app_schema, update_config, CONFIG, NEW_VERSION_DOWNLOADED};
pub use reactive::{Binding, Selector};
pub use schema::{Key, KeyDescriptor, Schema, StoreValue};
pub use store::{Listener, Phase, Store};
pub use window::{SetupHook, Window};
