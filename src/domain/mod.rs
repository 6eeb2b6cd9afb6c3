pub mod money;
pub mod payment;

pub use money::{format_decimal, from_minor_units, to_minor_units, validate_scale, Currency};
pub use payment::{Payment, PaymentChannel, PaymentStatus};
