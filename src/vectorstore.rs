//! Startup bootstrap for the file-search vector store.
//!
//! When a runtime credential exists but no store id is known, create a store,
//! upload the seed documents, and persist the id so later starts reuse it.

use anyhow::{anyhow, Context, Result};
use reqwest::multipart::{Form, Part};
use serde_json::{json, Value};
use std::time::Duration;

use crate::settings::Settings;

const STORE_NAME: &str = "Operator Agent Knowledge Base";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub const SEED_DOCUMENTS: &[(&str, &str)] = &[
    (
        "patagonia_notes.md",
        "# Patagonia Jacket Preferences

- Preferred color: Black or dark gray Patagonia jackets
- Size preference: Medium or Large depending on layering
- Essential features: Waterproof and breathable material
- Budget range: $200-$400 for quality items
- Style preference: Minimalist design without logos
- Material: Prefer recycled materials when available
- Hood: Must have adjustable hood for rain protection
- Pockets: Need at least 2 zippered pockets
- Season: Looking for 3-season jacket (spring/fall/winter)
- Warranty: Patagonia's lifetime warranty is important
",
    ),
    (
        "tokyo_shops.md",
        "# Tokyo Shopping Locations for Outdoor Gear

- **Shibuya**: Official Patagonia Tokyo Store - Full selection, knowledgeable staff
- **Harajuku**: Multiple outdoor shops on Meiji-dori, good for comparing brands
- **Shinjuku**: Department stores like Takashimaya have outdoor sections
- **Ginza**: High-end outdoor boutiques with premium selections
- **Ikebukuro**: Hands department store has extensive outdoor gear floor
",
    ),
];

/// Returns settings carrying the store id when one exists or was created.
/// Failures are logged and leave file search disabled.
pub async fn bootstrap(settings: Settings) -> Settings {
    if let Some(id) = &settings.vector_store_id {
        tracing::info!("[vectorstore] using existing vector store: {}", id);
        return settings;
    }
    let Some(api_key) = settings.openai_api_key.clone() else {
        tracing::info!("[vectorstore] no OPENAI_API_KEY, file search disabled");
        return settings;
    };

    tracing::info!("[vectorstore] no vector store configured, creating one");
    let client = StoreClient::new(&settings.openai_base_url, &api_key);
    let store_id = match client.create_seeded_store().await {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!("[vectorstore] creation failed, file search disabled: {:#}", e);
            return settings;
        }
    };

    match settings.clone().with_persisted_vector_store(&store_id) {
        Ok(updated) => {
            tracing::info!("[vectorstore] vector store {} created and saved", store_id);
            updated
        }
        Err(e) => {
            tracing::warn!("[vectorstore] could not persist store id {}: {}", store_id, e);
            Settings { vector_store_id: Some(store_id), ..settings }
        }
    }
}

struct StoreClient {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl StoreClient {
    fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            http: reqwest::Client::new(),
        }
    }

    async fn create_seeded_store(&self) -> Result<String> {
        let store = self
            .post_json("vector_stores", &json!({ "name": STORE_NAME }))
            .await
            .context("creating vector store")?;
        let store_id = id_of(&store)?;
        tracing::info!("[vectorstore] created vector store: {}", store_id);

        for (name, content) in SEED_DOCUMENTS {
            tracing::info!("[vectorstore] uploading {}", name);
            let file_id = self
                .upload(name, content)
                .await
                .with_context(|| format!("uploading {name}"))?;
            self.post_json(
                &format!("vector_stores/{store_id}/files"),
                &json!({ "file_id": file_id }),
            )
            .await
            .with_context(|| format!("attaching {name}"))?;
        }
        tracing::info!("[vectorstore] {} files added", SEED_DOCUMENTS.len());
        Ok(store_id)
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let response = self
            .http
            .post(format!("{}/{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2")
            .json(body)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        read_json(response).await
    }

    async fn upload(&self, name: &str, content: &str) -> Result<String> {
        let part = Part::bytes(content.as_bytes().to_vec())
            .file_name(name.to_string())
            .mime_str("text/markdown")?;
        let form = Form::new().text("purpose", "assistants").part("file", part);
        let response = self
            .http
            .post(format!("{}/files", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        id_of(&read_json(response).await?)
    }
}

async fn read_json(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        return Err(anyhow!("API returned {}: {}", status.as_u16(), text.chars().take(200).collect::<String>()));
    }
    Ok(serde_json::from_str(&text)?)
}

fn id_of(value: &Value) -> Result<String> {
    value["id"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("response has no id"))
}
