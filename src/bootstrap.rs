//! Wires repository, providers and insights from a [`Config`].

use std::sync::Arc;

use crate::config::{Config, StoreKind};
use crate::db::Database;
use crate::db_storage::PgLeadRepository;
use crate::email_client::HttpEmailProvider;
use crate::engine::OutreachEngine;
use crate::intelligence::{select_insights, HttpTextIntelligence, TextIntelligence};
use crate::repository::{InMemoryLeadRepository, LeadRepository};
use crate::voice_client::{HttpVoiceProvider, VoiceProvider};

pub async fn build_repository(config: &Config) -> anyhow::Result<Arc<dyn LeadRepository>> {
    match (config.store, config.database_url.as_deref()) {
        (StoreKind::Postgres, Some(url)) => {
            let db = Database::new(url).await?;
            tracing::info!("Lead store: PostgreSQL");
            Ok(Arc::new(PgLeadRepository::new(db.pool)))
        }
        (StoreKind::Postgres, None) => anyhow::bail!("DATABASE_URL is required for STORE=postgres"),
        (StoreKind::Memory, _) => {
            tracing::warn!("Lead store: in-memory; data is lost on restart");
            Ok(Arc::new(InMemoryLeadRepository::new()))
        }
    }
}

pub async fn build_engine(config: &Config) -> anyhow::Result<Arc<OutreachEngine>> {
    let repo = build_repository(config).await?;

    let email = Arc::new(HttpEmailProvider::new(
        config.email_api_base_url.clone(),
        config.email_api_key.clone(),
    )?);

    let voice: Option<Arc<dyn VoiceProvider>> =
        match (&config.voice_api_key, &config.voice_phone_number_id) {
            (Some(key), Some(phone_id)) => Some(Arc::new(HttpVoiceProvider::new(
                config.voice_api_base_url.clone(),
                key.clone(),
                phone_id.clone(),
            )?)),
            _ => {
                tracing::warn!("Voice provider not configured; hot-lead calls are disabled");
                None
            }
        };

    let model: Option<Arc<dyn TextIntelligence>> = match &config.intelligence_api_key {
        Some(key) => Some(Arc::new(HttpTextIntelligence::new(
            config.intelligence_api_base_url.clone(),
            key.clone(),
            config.intelligence_model.clone(),
        )?)),
        None => None,
    };
    let insights = select_insights(
        model,
        config.settings.weights.clone(),
        config.settings.intelligence_timeout,
    );

    Ok(Arc::new(OutreachEngine::new(
        repo,
        insights,
        email,
        voice,
        config.settings.clone(),
    )))
}
