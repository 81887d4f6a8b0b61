pub mod custom;
pub mod record;

pub use custom::{
    CustomActionCompleter, CustomActionErrorType, CustomActionExecutor, CustomActionHandler,
    CustomActionResult,
};
pub use record::{UiApiRecordHandler, swap_draft_id};
