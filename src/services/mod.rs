pub mod orchestrator;
pub mod webhook;

pub use orchestrator::{NewPayment, PaymentOrchestrator, PaymentReceipt};
pub use webhook::{NotificationOutcome, WebhookDispatcher};
