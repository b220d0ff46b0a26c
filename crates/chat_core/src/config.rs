use shared::domain::ChannelUrl;

/// Tuning knobs for the coordinator. Embedders start from `Default` and
/// override what they need.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Well-known url of the channel every user belongs to.
    pub shared_channel_url: ChannelUrl,
    pub shared_channel_name: String,
    /// Page size for the my-channels query.
    pub channel_list_limit: usize,
    /// Page size for history loads.
    pub history_page_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            shared_channel_url: ChannelUrl::new("general_chat"),
            shared_channel_name: "General Chat".into(),
            channel_list_limit: 20,
            history_page_size: 20,
        }
    }
}
