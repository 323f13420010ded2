mod context;
mod enactment;
mod instance;
mod token;

pub use context::{Effects, ExecutionContext};
pub use enactment::Enactment;
pub use instance::{ProcessInstance, TokenVariables};
pub use token::{Token, TokenId};
