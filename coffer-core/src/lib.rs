mod attributes;
pub mod b64;
mod client;
pub mod codec;
mod crypto;
mod session;

pub use attributes::FileAttributes;
pub use client::{ApiErrorClass, StoreClient, StoreError, TlsConnector, TlsSettings};
pub use codec::{BlockIndex, CodecError, DecodedObject, EncodedObject};
pub use crypto::{CryptoError, StoreKeys};
pub use reqwest::StatusCode;
pub use session::{
    DirectoryEntry, DirectoryListing, EncodedName, EntryKind, ListFilter, LoginInfo, NameElement,
    ObjectId, ObjectUpload, PROTOCOL_VERSION, ROOT_DIRECTORY_ID, StoreConnector, StoreSession,
};
