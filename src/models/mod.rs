mod license;
mod order;
mod package;
mod trial;

pub use license::*;
pub use order::*;
pub use package::*;
pub use trial::*;
