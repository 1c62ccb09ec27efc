mod error;
mod item;
mod priority;

pub use error::{CoreError, Result};
pub use item::{
    ElementRef, ElementRefs, ElementStatus, MessageId, PropertyRef, WorkItem, WorkItemBuilder,
};
pub use priority::Priority;
