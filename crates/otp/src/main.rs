use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use otp_core::{
    config::Config,
    domain::{ChatId, Order, OrderId},
    formatting::{self, user_error},
    messaging::{
        port::MessagingPort,
        throttled::{ThrottleConfig, ThrottledMessenger},
    },
    orders::OrderBook,
    ports::StatusReply,
    watcher::{OrderWatcher, WatchHandle, WatchReport},
    Error,
};
use otp_telegram::TelegramMessenger;
use otp_vendor::{classify_status, VendorClient};

/// Rent virtual numbers and deliver their OTP codes to a Telegram chat.
#[derive(Parser, Debug)]
#[command(name = "otp", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the vendor account balance.
    Balance,
    /// List services available in the configured country.
    Services {
        #[arg(long, default_value_t = 15)]
        limit: usize,
    },
    /// Rent a number and wait for its code.
    Rent {
        service: String,
        #[arg(default_value = "any")]
        operator: String,
        /// Chat that receives the notices.
        #[arg(long)]
        chat: i64,
    },
    /// Watch an existing order until its code arrives.
    Watch {
        order_id: String,
        #[arg(long)]
        chat: i64,
        /// Number shown in the success notice if the vendor does not echo it.
        #[arg(long)]
        phone: Option<String>,
    },
    /// Check an order once.
    Status { order_id: String },
    /// Cancel an order at the vendor.
    Cancel { order_id: String },
    /// Ask the vendor to send the SMS again.
    Resend { order_id: String },
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    let cfg = Config::load()?;
    let _log_guard = otp_core::logging::init("otp", cfg.log_file.as_deref())?;

    let vendor = Arc::new(VendorClient::new(cfg.vendor.clone())?);

    match cli.command {
        Command::Balance => {
            let balance = vendor.get_balance().await?;
            println!("Balance: {balance:.2} RUB");
        }
        Command::Services { limit } => {
            for s in vendor.get_services().await?.into_iter().take(limit) {
                println!("{:<8} {}", s.code, s.name);
            }
        }
        Command::Status { order_id } => {
            let raw = vendor.get_status(&OrderId(order_id)).await?;
            match classify_status(&raw) {
                StatusReply::CodeReady { code, .. } => println!("Code: {code}"),
                StatusReply::Pending => println!("Still waiting for the OTP..."),
                StatusReply::TerminalNegative(reason) => println!("Order ended: {reason:?}"),
                StatusReply::TransientError { message } => println!("Unclear reply: {message}"),
            }
        }
        Command::Cancel { order_id } => {
            vendor.cancel(&OrderId(order_id.clone())).await?;
            println!("Order {order_id} cancelled");
        }
        Command::Resend { order_id } => {
            vendor.request_resend(&OrderId(order_id.clone())).await?;
            println!("Requested another SMS for order {order_id}");
        }
        Command::Rent {
            service,
            operator,
            chat,
        } => {
            let app = App::new(&cfg, vendor.clone())?;
            let chat_id = ChatId(chat);

            let rental = match vendor.rent_number(&service, &operator).await {
                Ok(r) => r,
                Err(e) => {
                    error!("rent failed for {service}/{operator}: {e}");
                    notify_best_effort(app.messenger.as_ref(), chat_id, user_error(&e)).await;
                    return Err(e);
                }
            };
            info!(order_id = %rental.order_id, phone = %rental.phone, "number rented");

            let mut order = Order::new(rental.order_id.clone(), rental.phone.clone(), chat_id);
            order.service = service;
            order.operator = operator;
            order.price = rental.price.clone();
            app.orders.open(order)?;

            notify_best_effort(
                app.messenger.as_ref(),
                chat_id,
                &formatting::order_rented(&rental.order_id, &rental.phone, &rental.price),
            )
            .await;

            app.watch_to_end(rental.order_id, chat_id).await?;
        }
        Command::Watch {
            order_id,
            chat,
            phone,
        } => {
            let app = App::new(&cfg, vendor.clone())?;
            let order_id = OrderId(order_id);
            let chat_id = ChatId(chat);
            if let Some(phone) = phone {
                app.orders.open(Order::new(order_id.clone(), phone, chat_id))?;
            }
            app.watch_to_end(order_id, chat_id).await?;
        }
    }

    Ok(())
}

struct App {
    messenger: Arc<dyn MessagingPort>,
    orders: Arc<OrderBook>,
    watcher: OrderWatcher,
}

impl App {
    fn new(cfg: &Config, vendor: Arc<VendorClient>) -> Result<Self, Error> {
        let raw: Arc<dyn MessagingPort> =
            Arc::new(TelegramMessenger::new(cfg.require_telegram_token()?));
        let messenger: Arc<dyn MessagingPort> =
            Arc::new(ThrottledMessenger::new(raw, ThrottleConfig::default()));
        let orders = Arc::new(OrderBook::new());
        let watcher = OrderWatcher::new(
            cfg.watch.clone(),
            vendor,
            messenger.clone(),
            orders.clone(),
        );
        Ok(Self {
            messenger,
            orders,
            watcher,
        })
    }

    /// Run one watch to completion; Ctrl-C abandons it silently.
    async fn watch_to_end(&self, order_id: OrderId, chat_id: ChatId) -> Result<(), Error> {
        let Some(handle) = self.watcher.watch(order_id.clone(), chat_id) else {
            info!(order_id = %order_id, "order is already being watched");
            return Ok(());
        };

        let report = wait_or_interrupt(&self.watcher, handle).await?;
        match report {
            Some(r) => {
                info!(
                    order_id = %order_id,
                    queries = r.queries,
                    "watch finished: {:?}",
                    r.outcome
                );
                if let Some(order) = self.orders.get(chat_id) {
                    println!("{}", serde_json::to_string_pretty(&order)?);
                }
            }
            None => error!(order_id = %order_id, "watch ended without a report"),
        }
        Ok(())
    }
}

/// Send a notice outside the watcher; a failed send is logged, never fatal.
async fn notify_best_effort(messenger: &dyn MessagingPort, chat_id: ChatId, html: &str) -> bool {
    match messenger.send_html(chat_id, html).await {
        Ok(_) => true,
        Err(e) => {
            warn!(chat_id = chat_id.0, "failed to deliver notice: {e}");
            false
        }
    }
}

async fn wait_or_interrupt(
    watcher: &OrderWatcher,
    handle: WatchHandle,
) -> Result<Option<WatchReport>, Error> {
    let finished = handle.finished();
    tokio::pin!(finished);

    tokio::select! {
        report = &mut finished => Ok(report),
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("interrupted, abandoning in-flight watches");
            watcher.shutdown();
            Ok(finished.await)
        }
    }
}
