mod cancel;
mod registry;

pub mod prelude {
    pub use crate::cancel::{CancelHandle, CancelListener, CancelledError};
    pub use crate::registry::{CancelRegistry, RegistrationGuard};
}
