pub mod attribute;
pub mod attribute_path;
pub mod common;
pub mod data_set;
pub mod data_set_list;
pub mod parameter;
pub mod visibility_area;

pub use attribute::*;
pub use attribute_path::*;
pub use common::*;
pub use data_set::*;
pub use data_set_list::*;
pub use parameter::*;
pub use visibility_area::*;
