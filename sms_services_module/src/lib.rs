//! Provider layer for outbound SMS delivery.
//!
//! Every backend implements the [`SmsService`] capability trait and
//! normalizes its own failures into [`SendResult`] / [`StatusResult`];
//! nothing provider-specific crosses the trait boundary except the
//! opaque `details` map.

pub mod service;
pub mod textbelt;
pub mod twilio;

pub use service::{
    Credentials, Details, SendResult, ServiceError, SmsService, StatusResult, DELIVERY_DELIVERED,
    DELIVERY_FAILED, DELIVERY_PENDING, DELIVERY_SENT, DELIVERY_UNKNOWN,
};
pub use textbelt::TextBeltService;
pub use twilio::TwilioService;
