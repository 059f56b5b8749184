pub mod admin;
pub mod brand;
pub mod campaign;
pub mod contact_list;
pub mod delivery_log;
pub mod sequence;
pub mod short_url;
pub mod subscriber;

pub use admin::*;
pub use brand::*;
pub use campaign::*;
pub use contact_list::*;
pub use delivery_log::*;
pub use sequence::*;
pub use short_url::*;
pub use subscriber::*;
