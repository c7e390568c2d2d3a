use async_trait::async_trait;
use lever_core::{AlertPayload, ChannelType, EventBus, LeverEvent, Result};

use crate::adapter::ChannelAdapter;

/// In-app alerts: publishes onto the event bus, where the server's SSE feed
/// picks them up. Delivery succeeds even with no subscriber connected.
pub struct UiChannel {
    id: String,
    bus: EventBus,
}

impl UiChannel {
    pub fn new(id: impl Into<String>, bus: EventBus) -> Self {
        Self { id: id.into(), bus }
    }
}

#[async_trait]
impl ChannelAdapter for UiChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn channel_type(&self) -> ChannelType {
        ChannelType::Ui
    }

    async fn send(&self, payload: &AlertPayload) -> Result<()> {
        self.bus.publish(LeverEvent::Alert {
            payload: payload.clone(),
        });
        Ok(())
    }
}
