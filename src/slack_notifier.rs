use anyhow::{Context, Result};
use log::{error, info};
use slack_morphism::prelude::*;

use crate::config::SlackConfig;
use crate::models::ScanStats;

pub struct SlackNotifier {
    client: SlackClient<SlackClientHyperHttpsConnector>,
    token: SlackApiToken,
    channel_id: SlackChannelId,
}

impl SlackNotifier {
    pub fn new(config: &SlackConfig) -> Result<Self> {
        info!("Initialisation du notifier Slack");

        let client = SlackClient::new(SlackClientHyperHttpsConnector::new()?);
        let token = SlackApiToken::new(config.bot_token.clone().into());
        let channel_id = SlackChannelId::new(config.channel_id.clone());

        Ok(SlackNotifier {
            client,
            token,
            channel_id,
        })
    }

    pub async fn send_message(&self, text: &str) -> Result<()> {
        let post_chat_req = SlackApiChatPostMessageRequest::new(
            self.channel_id.clone(),
            SlackMessageContent::new().with_text(text.to_string()),
        );

        let session = self.client.open_session(&self.token);

        match session.chat_post_message(&post_chat_req).await {
            Ok(response) => {
                info!("✅ Message Slack envoyé: {:?}", response.ts);
                Ok(())
            }
            Err(e) => {
                error!("❌ Impossible d'envoyer le message Slack: {}", e);
                Err(anyhow::anyhow!("Impossible d'envoyer le message Slack: {}", e))
            }
        }
    }

    /// Envoie le récapitulatif après chaque analyse des boîtes mail
    pub async fn notify_scan_completed(&self, stats: &ScanStats, elapsed_secs: f64) -> Result<()> {
        self.send_message(&format_scan_summary(stats, elapsed_secs))
            .await
            .context("Impossible d'envoyer le récapitulatif Slack")
    }

    /// Envoie une notification d'erreur pour un utilisateur
    pub async fn notify_user_failed(&self, user_email: &str, error_message: &str) -> Result<()> {
        let message_text = format!(
            "❌ *Erreur lors de l'analyse de la boîte mail*\n\n\
             • Utilisateur: `{}`\n\
             • Erreur: ```{}```",
            user_email, error_message
        );

        self.send_message(&message_text)
            .await
            .context("Impossible d'envoyer le message d'erreur Slack")
    }
}

pub fn format_scan_summary(stats: &ScanStats, elapsed_secs: f64) -> String {
    let icon = if stats.failed == 0 { "✅" } else { "⚠️" };
    format!(
        "{} *Analyse des essais gratuits terminée*\n\n\
         • Utilisateurs analysés: *{}*\n\
         • Essais créés: *{}*\n\
         • Utilisateurs en erreur: *{}*\n\
         • Durée: {:.1}s",
        icon, stats.users, stats.created, stats.failed, elapsed_secs
    )
}
