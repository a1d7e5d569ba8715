//! Content-plane concerns: the transport codec and the keyed content store.

pub mod codec;
pub mod store;

pub use codec::{CodecError, ContentCodec};
pub use store::{ContentKey, ContentStore, ContentStoreError, MemoryContentStore, PgContentStore};
