//! CLI entity subcommands over the management API.

use clap::Subcommand;

use crate::client::{ApiClient, print_json};

fn parse_json(raw: &str) -> anyhow::Result<serde_json::Value> {
    // `@path` reads the JSON from a file, anything else is inline JSON.
    let text = if let Some(path) = raw.strip_prefix('@') {
        std::fs::read_to_string(path)?
    } else {
        raw.to_string()
    };
    Ok(serde_json::from_str(&text)?)
}

#[derive(Subcommand, Debug)]
pub(crate) enum ProviderCommands {
    /// List provider instances
    List {},
    /// Get one provider instance
    Get { provider: String, key: String },
    /// Create a provider instance from JSON (`@file` or inline)
    Create { json: String },
    /// Update a provider instance from JSON (`@file` or inline)
    Update { json: String },
    /// Delete a provider instance
    Delete { provider: String, key: String },
}

pub(crate) async fn providers(
    client: &ApiClient,
    command: ProviderCommands,
) -> anyhow::Result<()> {
    let result = match command {
        ProviderCommands::List {} => client.get("/management/v1/providers").await?,
        ProviderCommands::Get { provider, key } => {
            client
                .get(&format!("/management/v1/providers/{provider}/{key}"))
                .await?
        }
        ProviderCommands::Create { json } | ProviderCommands::Update { json } => {
            client
                .post("/management/v1/providers", &parse_json(&json)?)
                .await?
        }
        ProviderCommands::Delete { provider, key } => {
            client
                .delete(&format!("/management/v1/providers/{provider}/{key}"))
                .await?
        }
    };
    print_json(&result);
    Ok(())
}

#[derive(Subcommand, Debug)]
pub(crate) enum DriverCommands {
    /// List drivers
    List {},
    /// Get one driver
    Get { id: String },
    /// Create a driver from JSON (`@file` or inline)
    Create { json: String },
    /// Update a driver from JSON (`@file` or inline)
    Update { json: String },
    /// Delete a driver
    Delete { id: String },
}

pub(crate) async fn drivers(client: &ApiClient, command: DriverCommands) -> anyhow::Result<()> {
    let result = match command {
        DriverCommands::List {} => client.get("/management/v1/drivers").await?,
        DriverCommands::Get { id } => client.get(&format!("/management/v1/drivers/{id}")).await?,
        DriverCommands::Create { json } | DriverCommands::Update { json } => {
            client
                .post("/management/v1/drivers", &parse_json(&json)?)
                .await?
        }
        DriverCommands::Delete { id } => {
            client
                .delete(&format!("/management/v1/drivers/{id}"))
                .await?
        }
    };
    print_json(&result);
    Ok(())
}

#[derive(Subcommand, Debug)]
pub(crate) enum RuleCommands {
    /// List rules joined with their driver
    List {},
    /// Get one rule
    Get { id: String },
    /// Create a rule from JSON (`@file` or inline)
    Create { json: String },
    /// Update a rule from JSON (`@file` or inline)
    Update { id: String, json: String },
    /// Delete a rule
    Delete { id: String },
    /// Dry-run a payload against candidate rules (`@file` or inline JSON
    /// with `payload` and `rules` fields)
    Match { json: String },
}

pub(crate) async fn rules(client: &ApiClient, command: RuleCommands) -> anyhow::Result<()> {
    let result = match command {
        RuleCommands::List {} => client.get("/management/v1/rules").await?,
        RuleCommands::Get { id } => client.get(&format!("/management/v1/rules/{id}")).await?,
        RuleCommands::Create { json } => {
            client
                .post("/management/v1/rules", &parse_json(&json)?)
                .await?
        }
        RuleCommands::Update { id, json } => {
            client
                .put(&format!("/management/v1/rules/{id}"), &parse_json(&json)?)
                .await?
        }
        RuleCommands::Delete { id } => {
            client.delete(&format!("/management/v1/rules/{id}")).await?
        }
        RuleCommands::Match { json } => {
            client
                .post("/management/v1/rules/match", &parse_json(&json)?)
                .await?
        }
    };
    print_json(&result);
    Ok(())
}

#[derive(Subcommand, Debug)]
pub(crate) enum NamespaceCommands {
    /// List namespaces
    List {},
    /// Create or update a namespace from JSON (`@file` or inline)
    Update { json: String },
    /// Namespace webhook flag operations
    Webhook {
        #[command(subcommand)]
        command: WebhookCommands,
    },
}

#[derive(Subcommand, Debug)]
pub(crate) enum WebhookCommands {
    /// Read the webhook flag
    Get {
        provider: String,
        key: String,
        repo_id: String,
    },
    /// Update the webhook flag
    Update {
        provider: String,
        key: String,
        repo_id: String,
        #[arg(long)]
        enabled: bool,
    },
}

pub(crate) async fn namespaces(
    client: &ApiClient,
    command: NamespaceCommands,
) -> anyhow::Result<()> {
    let result = match command {
        NamespaceCommands::List {} => client.get("/management/v1/namespaces").await?,
        NamespaceCommands::Update { json } => {
            client
                .post("/management/v1/namespaces/sync", &parse_json(&json)?)
                .await?
        }
        NamespaceCommands::Webhook { command } => match command {
            WebhookCommands::Get {
                provider,
                key,
                repo_id,
            } => {
                client
                    .get(&format!(
                        "/management/v1/namespaces/{provider}/{key}/{repo_id}/webhook"
                    ))
                    .await?
            }
            WebhookCommands::Update {
                provider,
                key,
                repo_id,
                enabled,
            } => {
                client
                    .put(
                        &format!("/management/v1/namespaces/{provider}/{key}/{repo_id}/webhook"),
                        &serde_json::json!({"enabled": enabled}),
                    )
                    .await?
            }
        },
    };
    print_json(&result);
    Ok(())
}

#[derive(Subcommand, Debug)]
pub(crate) enum InstallationCommands {
    /// List installations
    List {},
    /// Get one installation
    Get { provider: String, id: String },
}

pub(crate) async fn installations(
    client: &ApiClient,
    command: InstallationCommands,
) -> anyhow::Result<()> {
    let result = match command {
        InstallationCommands::List {} => client.get("/management/v1/installations").await?,
        InstallationCommands::Get { provider, id } => {
            client
                .get(&format!("/management/v1/installations/{provider}/{id}"))
                .await?
        }
    };
    print_json(&result);
    Ok(())
}

#[derive(Subcommand, Debug)]
pub(crate) enum EventLogCommands {
    /// List event logs
    List {},
    /// Get one event log
    Get { id: String },
    /// Aggregate analytics
    Analytics {},
    /// Bucketed timeseries
    Timeseries {
        #[arg(long, default_value = "hour")]
        interval: String,
    },
    /// Grouped breakdown
    Breakdown {
        #[arg(long)]
        group_by: String,
        #[arg(long, default_value = "events")]
        sort_by: String,
        #[arg(long)]
        include_latency: bool,
    },
    /// Apply a terminal status
    UpdateStatus {
        id: String,
        #[arg(long)]
        status: String,
        #[arg(long)]
        error_message: Option<String>,
    },
}

pub(crate) async fn event_logs(
    client: &ApiClient,
    command: EventLogCommands,
) -> anyhow::Result<()> {
    let result = match command {
        EventLogCommands::List {} => client.get("/management/v1/event-logs").await?,
        EventLogCommands::Get { id } => {
            client
                .get(&format!("/management/v1/event-logs/{id}"))
                .await?
        }
        EventLogCommands::Analytics {} => {
            client.get("/management/v1/event-logs/analytics").await?
        }
        EventLogCommands::Timeseries { interval } => {
            client
                .get(&format!(
                    "/management/v1/event-logs/timeseries?interval={interval}"
                ))
                .await?
        }
        EventLogCommands::Breakdown {
            group_by,
            sort_by,
            include_latency,
        } => {
            client
                .get(&format!(
                    "/management/v1/event-logs/breakdown?group_by={group_by}&sort_by={sort_by}&include_latency={include_latency}"
                ))
                .await?
        }
        EventLogCommands::UpdateStatus {
            id,
            status,
            error_message,
        } => {
            client
                .post(
                    &format!("/management/v1/event-logs/{id}/status"),
                    &serde_json::json!({"status": status, "error_message": error_message}),
                )
                .await?
        }
    };
    print_json(&result);
    Ok(())
}
