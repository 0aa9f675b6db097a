use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;
use warehouse_ledger::{
    config::{self, AppConfig},
    db::{self, DbPool},
    dto::{
        AdjustStockRequest, CreateWarehouseRequest, DeductForSaleRequest, MovementQuery,
        ReceiveStockRequest, RegisterProductRequest, RestoreForCancellationRequest, StockLevel,
        StockLevelQuery, TransferStockRequest, WarehouseQuery, MAX_LIMIT,
    },
    entities::{MovementType, ReferenceType, StockRecordModel},
    events::{self, EventSender},
    services::{LedgerSettings, SeaOrmProductCatalog, StockService, WarehouseService},
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let context = CliContext::initialize().await?;

    match cli.command {
        Commands::Migrate => {
            db::run_migrations(&context.db)
                .await
                .context("failed to run migrations")?;
            println!("Migrations applied");
        }
        Commands::Warehouse(command) => handle_warehouse_command(&context, command, cli.json).await?,
        Commands::Product(command) => handle_product_command(&context, command, cli.json).await?,
        Commands::Stock(command) => {
            handle_stock_command(&context, command, cli.actor, cli.json).await?
        }
    }

    Ok(())
}

#[derive(Parser)]
#[command(name = "ledger-cli", about = "Warehouse stock ledger administration", version)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON"
    )]
    json: bool,
    #[arg(
        long,
        global = true,
        default_value_t = Uuid::nil(),
        value_parser = clap::value_parser!(Uuid),
        help = "Identifier of the acting user recorded on movements"
    )]
    actor: Uuid,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate,
    #[command(subcommand)]
    Warehouse(WarehouseCommands),
    #[command(subcommand)]
    Product(ProductCommands),
    #[command(subcommand)]
    Stock(StockCommands),
}

#[derive(Subcommand)]
enum WarehouseCommands {
    Create(CreateWarehouseArgs),
    List(ListWarehousesArgs),
    Show(IdArgs),
    Delete(IdArgs),
}

#[derive(Subcommand)]
enum ProductCommands {
    Register(RegisterProductArgs),
}

#[derive(Subcommand)]
enum StockCommands {
    Adjust(AdjustArgs),
    Transfer(TransferArgs),
    Receive(ReceiveArgs),
    Deduct(OrderArgs),
    Restore(OrderArgs),
    Show(ShowStockArgs),
    Levels(LevelsArgs),
    Movements(MovementsArgs),
    Alerts,
}

#[derive(Args)]
struct PageArgs {
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    page: u32,
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=i64::from(MAX_LIMIT)), help = "Page size; defaults to the configured api_default_page_size")]
    limit: Option<u32>,
}

impl PageArgs {
    /// Page size capped at the configured maximum.
    fn limit(&self, config: &AppConfig) -> u32 {
        self.limit
            .unwrap_or(config.api_default_page_size)
            .min(config.api_max_page_size)
    }
}

#[derive(Args)]
struct IdArgs {
    #[arg(value_parser = clap::value_parser!(Uuid), help = "Warehouse identifier (UUID)")]
    id: Uuid,
}

#[derive(Args)]
struct CreateWarehouseArgs {
    #[arg(long)]
    name: String,
    #[arg(long, help = "Unique warehouse code")]
    code: String,
    #[arg(long)]
    country: String,
    #[arg(long)]
    city: String,
    #[arg(long)]
    address: Option<String>,
    #[arg(long)]
    phone: Option<String>,
    #[arg(long)]
    email: Option<String>,
    #[arg(long, action = ArgAction::SetTrue, help = "Create the warehouse inactive")]
    inactive: bool,
    #[arg(long, action = ArgAction::SetTrue, help = "Mark as the default warehouse")]
    default: bool,
}

#[derive(Args)]
struct ListWarehousesArgs {
    #[arg(long)]
    country: Option<String>,
    #[arg(long)]
    active: Option<bool>,
    #[command(flatten)]
    page: PageArgs,
}

#[derive(Args)]
struct RegisterProductArgs {
    #[arg(long)]
    sku: String,
    #[arg(long)]
    name: String,
    #[arg(long, help = "URL slug; derived from the name when omitted")]
    slug: Option<String>,
}

#[derive(Args)]
struct AdjustArgs {
    #[arg(long, value_parser = clap::value_parser!(Uuid))]
    warehouse: Uuid,
    #[arg(long, value_parser = clap::value_parser!(Uuid))]
    product: Uuid,
    #[arg(long, allow_hyphen_values = true, help = "Signed delta, e.g. 50 or -5")]
    quantity: i32,
    #[arg(long)]
    reason: String,
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Args)]
struct TransferArgs {
    #[arg(long, value_parser = clap::value_parser!(Uuid))]
    from: Uuid,
    #[arg(long, value_parser = clap::value_parser!(Uuid))]
    to: Uuid,
    #[arg(long, value_parser = clap::value_parser!(Uuid))]
    product: Uuid,
    #[arg(long)]
    quantity: i32,
    #[arg(long)]
    reason: String,
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Args)]
struct ReceiveArgs {
    #[arg(long, value_parser = clap::value_parser!(Uuid))]
    warehouse: Uuid,
    #[arg(long, value_parser = clap::value_parser!(Uuid))]
    product: Uuid,
    #[arg(long)]
    quantity: i32,
    #[arg(long = "purchase-order", value_parser = clap::value_parser!(Uuid))]
    purchase_order: Uuid,
}

#[derive(Args)]
struct OrderArgs {
    #[arg(long, value_parser = clap::value_parser!(Uuid))]
    warehouse: Uuid,
    #[arg(long, value_parser = clap::value_parser!(Uuid))]
    product: Uuid,
    #[arg(long)]
    quantity: i32,
    #[arg(long, value_parser = clap::value_parser!(Uuid))]
    order: Uuid,
}

#[derive(Args)]
struct ShowStockArgs {
    #[arg(long, value_parser = clap::value_parser!(Uuid))]
    warehouse: Uuid,
    #[arg(long, value_parser = clap::value_parser!(Uuid))]
    product: Uuid,
}

#[derive(Args)]
struct LevelsArgs {
    #[arg(long, value_parser = clap::value_parser!(Uuid))]
    warehouse: Option<Uuid>,
    #[arg(long, value_parser = clap::value_parser!(Uuid))]
    product: Option<Uuid>,
    #[arg(long, action = ArgAction::SetTrue)]
    low_stock: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    out_of_stock: bool,
    #[command(flatten)]
    page: PageArgs,
}

#[derive(Args)]
struct MovementsArgs {
    #[arg(long, value_parser = clap::value_parser!(Uuid))]
    warehouse: Option<Uuid>,
    #[arg(long, value_parser = clap::value_parser!(Uuid))]
    product: Option<Uuid>,
    #[arg(long, value_parser = parse_movement_type, help = "e.g. sale, adjustment, transfer_in")]
    movement_type: Option<MovementType>,
    #[arg(long, value_parser = parse_reference_type, help = "e.g. order, transfer, purchase_order")]
    reference_type: Option<ReferenceType>,
    #[arg(long, help = "RFC 3339 lower bound on created_at")]
    since: Option<DateTime<Utc>>,
    #[arg(long, help = "RFC 3339 upper bound on created_at")]
    until: Option<DateTime<Utc>>,
    #[command(flatten)]
    page: PageArgs,
}

struct CliContext {
    config: AppConfig,
    db: Arc<DbPool>,
    event_sender: EventSender,
}

impl CliContext {
    async fn initialize() -> Result<Self> {
        let config = config::load_config().context("failed to load application config")?;
        config::init_tracing(config.log_level(), config.log_json);

        let db_pool = db::establish_connection_from_app_config(&config)
            .await
            .context("failed to connect to database")?;
        let db = Arc::new(db_pool);

        if config.auto_migrate {
            db::run_migrations(&db)
                .await
                .context("failed to run migrations")?;
        }

        let (event_sender, event_rx) = EventSender::channel(config.event_channel_capacity);
        tokio::spawn(events::process_events(event_rx));
        debug!(target: "ledger_cli", "event consumer started");

        Ok(Self {
            config,
            db,
            event_sender,
        })
    }

    fn catalog(&self) -> SeaOrmProductCatalog {
        SeaOrmProductCatalog::new(self.db.clone())
    }

    fn stock_service(&self) -> StockService {
        StockService::new(self.db.clone(), Arc::new(self.catalog()))
            .with_event_sender(self.event_sender.clone())
            .with_settings(LedgerSettings::from(&self.config))
    }

    fn warehouse_service(&self) -> WarehouseService {
        WarehouseService::new(self.db.clone())
            .with_event_sender(self.event_sender.clone())
            .with_statement_timeout(self.config.statement_timeout())
    }
}

async fn handle_warehouse_command(
    context: &CliContext,
    command: WarehouseCommands,
    json: bool,
) -> Result<()> {
    let service = context.warehouse_service();
    match command {
        WarehouseCommands::Create(args) => {
            let warehouse = service
                .create(CreateWarehouseRequest {
                    name: args.name,
                    code: args.code,
                    country: args.country,
                    city: args.city,
                    address: args.address,
                    phone: args.phone,
                    email: args.email,
                    is_active: Some(!args.inactive),
                    is_default: Some(args.default),
                })
                .await
                .context("failed to create warehouse")?;
            if json {
                print_json(&warehouse)?;
            } else {
                println!("Created warehouse {} ({})", warehouse.code, warehouse.id);
            }
        }
        WarehouseCommands::List(args) => {
            let page = service
                .list(WarehouseQuery {
                    country: args.country,
                    is_active: args.active,
                    page: args.page.page,
                    limit: args.page.limit(&context.config),
                })
                .await
                .context("failed to list warehouses")?;
            if json {
                print_json(&page)?;
            } else {
                for w in &page.data {
                    println!(
                        "- {} • {} • {}, {} • {}",
                        w.code,
                        w.name,
                        w.city,
                        w.country,
                        if w.is_active { "active" } else { "inactive" }
                    );
                }
                println!("Page {}/{} ({} total)", page.page, page.total_pages, page.total);
            }
        }
        WarehouseCommands::Show(args) => {
            let details = service
                .find_by_id(args.id)
                .await
                .context("failed to load warehouse")?;
            if json {
                print_json(&details)?;
            } else {
                println!(
                    "{} ({}) • {}, {} • {} products, {} items",
                    details.warehouse.name,
                    details.warehouse.code,
                    details.warehouse.city,
                    details.warehouse.country,
                    details.stock_summary.product_count,
                    details.stock_summary.total_items
                );
            }
        }
        WarehouseCommands::Delete(args) => {
            service
                .delete(args.id)
                .await
                .context("failed to delete warehouse")?;
            println!("Warehouse deleted successfully");
        }
    }
    Ok(())
}

async fn handle_product_command(
    context: &CliContext,
    command: ProductCommands,
    json: bool,
) -> Result<()> {
    match command {
        ProductCommands::Register(args) => {
            let product = context
                .catalog()
                .register(RegisterProductRequest {
                    sku: args.sku,
                    name: args.name,
                    slug: args.slug,
                })
                .await
                .context("failed to register product")?;
            if json {
                print_json(&product)?;
            } else {
                println!("Registered product {} ({})", product.sku, product.id);
            }
        }
    }
    Ok(())
}

async fn handle_stock_command(
    context: &CliContext,
    command: StockCommands,
    actor: Uuid,
    json: bool,
) -> Result<()> {
    let service = context.stock_service();
    match command {
        StockCommands::Adjust(args) => {
            let record = service
                .adjust_stock(
                    AdjustStockRequest {
                        warehouse_id: args.warehouse,
                        product_id: args.product,
                        quantity: args.quantity,
                        reason: args.reason,
                        notes: args.notes,
                    },
                    actor,
                )
                .await
                .context("failed to adjust stock")?;
            render_record(&record, json)?;
        }
        StockCommands::Transfer(args) => {
            let result = service
                .transfer_stock(
                    TransferStockRequest {
                        source_warehouse_id: args.from,
                        destination_warehouse_id: args.to,
                        product_id: args.product,
                        quantity: args.quantity,
                        reason: args.reason,
                        notes: args.notes,
                    },
                    actor,
                )
                .await
                .context("failed to transfer stock")?;
            if json {
                print_json(&result)?;
            } else {
                println!(
                    "Transfer {}: source now {}, destination now {}",
                    result.transfer_id, result.source.new_quantity, result.destination.new_quantity
                );
            }
        }
        StockCommands::Receive(args) => {
            let record = service
                .receive_stock(
                    ReceiveStockRequest {
                        warehouse_id: args.warehouse,
                        product_id: args.product,
                        quantity: args.quantity,
                        purchase_order_id: args.purchase_order,
                    },
                    actor,
                )
                .await
                .context("failed to receive stock")?;
            render_record(&record, json)?;
        }
        StockCommands::Deduct(args) => {
            let record = service
                .deduct_for_sale(
                    DeductForSaleRequest {
                        warehouse_id: args.warehouse,
                        product_id: args.product,
                        quantity: args.quantity,
                        order_id: args.order,
                    },
                    actor,
                )
                .await
                .context("failed to deduct stock")?;
            render_record(&record, json)?;
        }
        StockCommands::Restore(args) => {
            let record = service
                .restore_for_cancellation(
                    RestoreForCancellationRequest {
                        warehouse_id: args.warehouse,
                        product_id: args.product,
                        quantity: args.quantity,
                        order_id: args.order,
                    },
                    actor,
                )
                .await
                .context("failed to restore stock")?;
            render_record(&record, json)?;
        }
        StockCommands::Show(args) => {
            let level = service
                .get_product_stock(args.warehouse, args.product)
                .await
                .context("failed to load stock record")?;
            if json {
                print_json(&level)?;
            } else {
                render_level(&level);
            }
        }
        StockCommands::Levels(args) => {
            let page = service
                .get_stock_levels(StockLevelQuery {
                    warehouse_id: args.warehouse,
                    product_id: args.product,
                    low_stock: args.low_stock,
                    out_of_stock: args.out_of_stock,
                    page: args.page.page,
                    limit: args.page.limit(&context.config),
                })
                .await
                .context("failed to list stock levels")?;
            if json {
                print_json(&page)?;
            } else {
                page.data.iter().for_each(render_level);
                println!("Page {}/{} ({} total)", page.page, page.total_pages, page.total);
            }
        }
        StockCommands::Movements(args) => {
            let page = service
                .get_movements(MovementQuery {
                    warehouse_id: args.warehouse,
                    product_id: args.product,
                    movement_type: args.movement_type,
                    reference_type: args.reference_type,
                    start_date: args.since,
                    end_date: args.until,
                    page: args.page.page,
                    limit: args.page.limit(&context.config),
                })
                .await
                .context("failed to list movements")?;
            if json {
                print_json(&page)?;
            } else {
                for entry in &page.data {
                    let m = &entry.movement;
                    println!(
                        "- {} • {:?} {} {} • warehouse {} • product {} • {}",
                        m.created_at.to_rfc3339(),
                        m.movement_type,
                        if m.signed_quantity() >= 0 { "+" } else { "-" },
                        m.quantity,
                        m.warehouse_id,
                        m.product_id,
                        m.reason.as_deref().unwrap_or("")
                    );
                }
                println!("Page {}/{} ({} total)", page.page, page.total_pages, page.total);
            }
        }
        StockCommands::Alerts => {
            let alerts = service.get_alerts().await.context("failed to load alerts")?;
            if json {
                print_json(&alerts)?;
            } else {
                println!("Low stock ({}):", alerts.low_stock.len());
                alerts.low_stock.iter().for_each(render_level);
                println!("Out of stock ({}):", alerts.out_of_stock.len());
                alerts.out_of_stock.iter().for_each(render_level);
            }
        }
    }
    Ok(())
}

fn parse_movement_type(value: &str) -> Result<MovementType, String> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| format!("unknown movement type '{}'", value))
}

fn parse_reference_type(value: &str) -> Result<ReferenceType, String> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| format!("unknown reference type '{}'", value))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn render_record(record: &StockRecordModel, json: bool) -> Result<()> {
    if json {
        return print_json(record);
    }
    println!(
        "Warehouse {} • product {} • quantity {} (threshold {})",
        record.warehouse_id, record.product_id, record.quantity, record.low_stock_threshold
    );
    Ok(())
}

fn render_level(level: &StockLevel) {
    let warehouse = level
        .warehouse
        .as_ref()
        .map(|w| w.code.clone())
        .unwrap_or_else(|| level.record.warehouse_id.to_string());
    let product = level
        .product
        .as_ref()
        .map(|p| p.sku.clone())
        .unwrap_or_else(|| level.record.product_id.to_string());
    println!(
        "- {} • {} • quantity {} (threshold {})",
        warehouse, product, level.record.quantity, level.record.low_stock_threshold
    );
}
