use clap::{Parser, Subcommand};
use std::path::PathBuf;

use vibe_core::Principal;

mod commands;
mod logging;

#[derive(Parser, Debug)]
#[command(name = "vibe", version, about = "Vibe tenant access layer: operator CLI")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, short = 'c', global = true, env = "VIBE_CONFIG", default_value = "vibe.yaml")]
    config: PathBuf,

    /// Operator name recorded for admin actions
    #[arg(long = "as", global = true, env = "VIBE_OPERATOR", default_value = "operator")]
    operator: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate the configuration file
    Check,

    /// Encryption key management
    Keys {
        #[command(subcommand)]
        cmd: KeysCommand,
    },

    /// Control database schema management
    Schema {
        #[command(subcommand)]
        cmd: SchemaCommand,
    },

    /// Tenant lifecycle
    Tenant {
        #[command(subcommand)]
        cmd: TenantCommand,
    },

    /// Database servers and their sealed admin credentials
    Server {
        #[command(subcommand)]
        cmd: ServerCommand,
    },

    /// Tenant database grants
    Grant {
        #[command(subcommand)]
        cmd: GrantCommand,
    },

    /// Create a login role for a tenant on a registered server
    Provision {
        #[arg(long)]
        tenant: String,
        /// Server name or id
        #[arg(long)]
        server: String,
        #[arg(long)]
        database: String,
    },

    /// Show a tenant's effective capabilities on a schema or table
    Capabilities {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        database: String,
        #[arg(long, default_value = "public")]
        schema: String,
        #[arg(long)]
        table: Option<String>,
    },

    /// List a tenant's schema and table permissions
    Permissions {
        #[arg(long)]
        tenant: String,
    },

    /// List the tables of a schema the tenant can see
    Tables {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        database: String,
        #[arg(long, default_value = "public")]
        schema: String,
    },

    /// Describe the columns of a table as the tenant sees it
    Describe {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        database: String,
        #[arg(long, default_value = "public")]
        schema: String,
        table: String,
    },

    /// Print recent audit entries
    Audit {
        #[arg(long)]
        tenant: Option<String>,
        #[arg(long)]
        database: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

#[derive(Subcommand, Debug)]
enum KeysCommand {
    /// Generate a new base64 sealing key
    Generate {
        /// Write the key to this file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum SchemaCommand {
    /// Create the control tables if they do not exist
    Init,
}

#[derive(Subcommand, Debug)]
enum TenantCommand {
    /// Create a tenant
    Create {
        #[arg(long)]
        email: String,
        #[arg(long)]
        organization: Option<String>,
    },

    /// Delete a tenant and everything it owns
    Remove { tenant: String },
}

#[derive(Subcommand, Debug)]
enum ServerCommand {
    /// Register a server with its admin login
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        host: String,
        #[arg(long, default_value_t = 5432)]
        port: u16,
        #[arg(long)]
        admin_user: String,
        /// Environment variable holding the admin password
        #[arg(long, default_value = "VIBE_ADMIN_PASSWORD")]
        password_env: String,
        #[arg(long, default_value = "prefer")]
        ssl_mode: String,
    },
}

#[derive(Subcommand, Debug)]
enum GrantCommand {
    /// Bind a tenant to a database with a full connection string
    Add {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        database: String,
        /// Environment variable holding the connection string
        #[arg(long, default_value = "VIBE_CONNECTION_STRING")]
        connection_env: String,
    },

    /// List a tenant's grants
    List { tenant: String },

    /// Deactivate a tenant's grant on a database
    Revoke {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        database: String,
    },

    /// Print the decrypted connection string of a grant
    ConnectionString {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        database: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let admin = Principal::Admin {
        name: cli.operator.clone(),
    };

    match cli.cmd {
        Command::Check => commands::check::run(&cli.config)?,
        Command::Keys {
            cmd: KeysCommand::Generate { output },
        } => {
            logging::init_default();
            commands::keys::generate(output)?
        }
        Command::Schema {
            cmd: SchemaCommand::Init,
        } => {
            let config = commands::load_config(&cli.config)?;
            commands::schema::init(&config).await?
        }
        Command::Tenant { cmd } => {
            let stack = commands::connect(&cli.config).await?;
            let result = match cmd {
                TenantCommand::Create {
                    email,
                    organization,
                } => commands::tenant::create(&stack, &email, organization).await,
                TenantCommand::Remove { tenant } => {
                    commands::tenant::remove(&stack, &admin, &tenant).await
                }
            };
            stack.shutdown().await;
            result?
        }
        Command::Server {
            cmd:
                ServerCommand::Add {
                    name,
                    host,
                    port,
                    admin_user,
                    password_env,
                    ssl_mode,
                },
        } => {
            let stack = commands::connect(&cli.config).await?;
            let server = commands::grants::ServerArgs {
                name,
                host,
                port,
                admin_user,
                password_env,
                ssl_mode,
            };
            let result = commands::grants::add_server(&stack, server).await;
            stack.shutdown().await;
            result?
        }
        Command::Grant { cmd } => {
            let stack = commands::connect(&cli.config).await?;
            let result = match cmd {
                GrantCommand::Add {
                    tenant,
                    database,
                    connection_env,
                } => commands::grants::add(&stack, &tenant, &database, &connection_env).await,
                GrantCommand::List { tenant } => commands::grants::list(&stack, &tenant).await,
                GrantCommand::Revoke { tenant, database } => {
                    commands::grants::revoke(&stack, &tenant, &database).await
                }
                GrantCommand::ConnectionString { tenant, database } => {
                    commands::grants::connection_string(&stack, &admin, &tenant, &database).await
                }
            };
            stack.shutdown().await;
            result?
        }
        Command::Provision {
            tenant,
            server,
            database,
        } => {
            let stack = commands::connect(&cli.config).await?;
            let result =
                commands::grants::provision(&stack, &admin, &tenant, &server, &database).await;
            stack.shutdown().await;
            result?
        }
        Command::Capabilities {
            tenant,
            database,
            schema,
            table,
        } => {
            let stack = commands::connect(&cli.config).await?;
            let result = commands::inspect::capabilities(
                &stack,
                &tenant,
                &database,
                &schema,
                table.as_deref(),
            )
            .await;
            stack.shutdown().await;
            result?
        }
        Command::Permissions { tenant } => {
            let stack = commands::connect(&cli.config).await?;
            let result = commands::inspect::permissions(&stack, &tenant).await;
            stack.shutdown().await;
            result?
        }
        Command::Tables {
            tenant,
            database,
            schema,
        } => {
            let stack = commands::connect(&cli.config).await?;
            let result = commands::inspect::tables(&stack, &tenant, &database, &schema).await;
            stack.shutdown().await;
            result?
        }
        Command::Describe {
            tenant,
            database,
            schema,
            table,
        } => {
            let stack = commands::connect(&cli.config).await?;
            let result =
                commands::inspect::describe(&stack, &tenant, &database, &schema, &table).await;
            stack.shutdown().await;
            result?
        }
        Command::Audit {
            tenant,
            database,
            limit,
        } => {
            let stack = commands::connect(&cli.config).await?;
            let result =
                commands::inspect::audit(&stack, tenant.as_deref(), database, limit).await;
            stack.shutdown().await;
            result?
        }
    }

    Ok(())
}
