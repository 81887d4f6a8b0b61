pub mod action;
pub mod error;
pub mod field_value;
pub mod hlc;
pub mod ids;
pub mod object_info;
pub mod record;

pub use action::*;
pub use error::CoreError;
pub use field_value::{FieldValue, StoreLink};
pub use hlc::{DraftClock, Hlc};
pub use ids::*;
pub use object_info::{FieldDataType, FieldInfo, ObjectInfo, ReferenceInfo};
pub use record::*;
