//! # lever-channels
//!
//! Alert channel adapters. The engine hands each adapter an
//! [`AlertPayload`](lever_core::AlertPayload) and nothing else; delivery,
//! formatting and retries are the adapter's business.
//!
//! | Channel | Adapter            | Transport                          |
//! |---------|--------------------|------------------------------------|
//! | UI      | [`UiChannel`]      | engine event bus (SSE feed)        |
//! | WEBHOOK | [`WebhookChannel`] | JSON POST of the raw payload       |
//! | SLACK   | [`SlackChannel`]   | Slack incoming webhook             |
//! | EMAIL   | [`EmailChannel`]   | JSON POST to an HTTP mail relay    |

pub mod adapter;
pub mod email;
pub mod registry;
pub mod retry;
pub mod slack;
pub mod ui;
pub mod webhook;

pub use adapter::{ChannelAdapter, summary_line};
pub use email::EmailChannel;
pub use registry::ChannelRegistry;
pub use retry::RetryPolicy;
pub use slack::SlackChannel;
pub use ui::UiChannel;
pub use webhook::WebhookChannel;
