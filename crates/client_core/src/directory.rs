use shared::domain::Channel;

/// Last successfully loaded set of selectable channels. Loading never
/// happens automatically after startup; see [`crate::ChatClient::reload_channels`].
#[derive(Debug, Default, Clone)]
pub struct ChannelDirectory {
    channels: Vec<Channel>,
}

impl ChannelDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&mut self, channels: Vec<Channel>) {
        self.channels = channels;
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels.iter().any(|channel| channel.name == name)
    }
}
