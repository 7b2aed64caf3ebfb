pub mod ask;
pub mod check;
pub mod routes;

pub use ask::AskCommand;
pub use check::CheckCommand;
pub use routes::RoutesCommand;
