use super::{RecordSource, RecordStream, SourceError};
use crate::message::RawRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serenity::all::{ChannelId, GetMessages, Message, MessageId};
use serenity::http::{Http, HttpError};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, info};

/// Discord's maximum page size for channel history.
const PAGE_SIZE: u8 = 100;
/// Milliseconds since the Unix epoch at 2015-01-01T00:00:00Z.
const DISCORD_EPOCH_MS: i64 = 1_420_070_400_000;

/// Reads a single text channel's history over the REST API.
pub struct DiscordSource {
    http: Arc<Http>,
    channel_id: ChannelId,
    page_delay: Duration,
}

impl DiscordSource {
    pub fn new(token: &str, channel_id: u64, page_delay_ms: u64) -> Self {
        Self {
            http: Arc::new(Http::new(token)),
            channel_id: ChannelId::new(channel_id),
            page_delay: Duration::from_millis(page_delay_ms),
        }
    }

    async fn verify(&self) -> Result<(), SourceError> {
        let me = self
            .http
            .get_current_user()
            .await
            .map_err(|e| classify(e, "token check"))?;
        info!("Logged in as {} (ID: {})", me.name, me.id);

        self.http
            .get_channel(self.channel_id)
            .await
            .map_err(|e| match classify(e, "channel lookup") {
                SourceError::ChannelNotFound(_) => {
                    SourceError::ChannelNotFound(self.channel_id.to_string())
                }
                other => other,
            })?;
        Ok(())
    }
}

#[async_trait]
impl RecordSource for DiscordSource {
    async fn fetch(&self, since: DateTime<Utc>) -> Result<RecordStream<'_>, SourceError> {
        self.verify().await?;
        info!("Fetching messages since: {}", since.to_rfc3339());

        let stream = async_stream::stream! {
            let mut cursor = snowflake_at(since);
            let mut page_no = 0usize;
            loop {
                let builder = GetMessages::new().after(cursor).limit(PAGE_SIZE);
                let page = match self.channel_id.messages(&self.http, builder).await {
                    Ok(page) => page,
                    Err(e) => {
                        yield Err(classify(e, "history page"));
                        break;
                    }
                };
                page_no += 1;
                debug!("Discord: page {} returned {} messages", page_no, page.len());

                let newest = match page.iter().map(|m| m.id).max() {
                    Some(id) => id,
                    None => break,
                };
                let full = page.len() >= PAGE_SIZE as usize;

                for msg in page {
                    yield Ok(to_raw(msg));
                }

                if !full {
                    break;
                }
                cursor = newest;
                sleep(self.page_delay).await;
            }
        };

        Ok(Box::pin(stream))
    }
}

fn to_raw(msg: Message) -> RawRecord {
    let nick = msg.member.as_ref().and_then(|m| m.nick.clone());
    let author_display_name = display_name(nick, msg.author.global_name.clone(), &msg.author.name);
    RawRecord {
        id: msg.id.to_string(),
        channel_id: msg.channel_id.to_string(),
        author_id: msg.author.id.to_string(),
        author_display_name,
        authored_at: msg.timestamp.to_string(),
        attachment_count: msg.attachments.len(),
        content: msg.content,
    }
}

/// Guild nickname, then global display name, then username.
fn display_name(nick: Option<String>, global_name: Option<String>, username: &str) -> String {
    nick.filter(|n| !n.trim().is_empty())
        .or(global_name.filter(|n| !n.trim().is_empty()))
        .unwrap_or_else(|| username.to_string())
}

/// Smallest message id Discord could assign at `at`, for `after=` paging.
fn snowflake_at(at: DateTime<Utc>) -> MessageId {
    let ms = (at.timestamp_millis() - DISCORD_EPOCH_MS).max(0) as u64;
    MessageId::new((ms << 22).max(1))
}

fn classify(err: serenity::Error, what: &str) -> SourceError {
    match &err {
        serenity::Error::Http(HttpError::UnsuccessfulRequest(resp)) => {
            classify_status(resp.status_code.as_u16(), &format!("{}: {}", what, err))
        }
        _ => SourceError::Connection(format!("{}: {}", what, err)),
    }
}

fn classify_status(status: u16, detail: &str) -> SourceError {
    match status {
        401 => SourceError::Unauthorized(detail.to_string()),
        403 | 404 => SourceError::ChannelNotFound(detail.to_string()),
        _ => SourceError::Connection(detail.to_string()),
    }
}
