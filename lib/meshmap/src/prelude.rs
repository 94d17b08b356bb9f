pub use crate::net::{DatagramOptions, Options};
pub use crate::replicator::Replicator;
pub use crate::store::{Entry, MapStore, StoreError};
pub use ember::PeerId;
