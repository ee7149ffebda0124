pub mod auto_reply;
pub mod media_forward;
pub mod media_group;
pub mod presence;

pub use auto_reply::AutoReplyHandler;
pub use media_forward::MediaForwardHandler;
