pub mod charger;
pub mod group;
pub mod schedule;
pub mod session;
pub mod tag;

pub use charger::*;
pub use group::*;
pub use schedule::*;
pub use session::*;
pub use tag::*;
