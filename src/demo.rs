//! Pipeline de pedidos de demonstração executado pelo subcomando `demo`.
//!
//! `receive` dispara uma thread assíncrona por pedido e junta todas;
//! cada pedido reserva estoque em paralelo e depois cobra pelo gateway,
//! que fica pronto de forma assíncrona. Pedidos recusados escalam para
//! `refund`. Por fim `summarize` lê o razão compartilhado do processo.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use jobkernel::{
    Engine, EngineError, Failure, JobContext, JobSpec, Loaded, Outcome, Parameter, ProcessGraph,
    ResourceHandle, ResourceObject, ResourceScope, ResourceSource, ResourceSpec,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};

/// Job inicial do processo.
pub const ENTRY: &str = "receive";

/// Pedidos cujo id deixa este resto são recusados pelo gateway.
const DECLINE_EVERY: u64 = 4;

#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub order: u64,
    pub event: &'static str,
    pub amount_cents: u64,
}

#[derive(Default)]
pub struct Ledger {
    entries: Mutex<Vec<LedgerEntry>>,
}

impl Ledger {
    fn record(&self, order: u64, event: &'static str, amount_cents: u64) {
        self.entries.lock().push(LedgerEntry {
            order,
            event,
            amount_cents,
        });
    }

    fn entries(&self) -> Vec<LedgerEntry> {
        self.entries.lock().clone()
    }
}

/// Preços por SKU, em centavos.
struct Catalog(HashMap<&'static str, u64>);

struct Gateway {
    latency: Duration,
}

struct CatalogSource;

impl ResourceSource for CatalogSource {
    fn load(&self, _handle: ResourceHandle) -> Result<Loaded, Failure> {
        Ok(Loaded::ready(Catalog(HashMap::from([
            ("book", 3_990),
            ("lamp", 12_500),
            ("mug", 1_450),
        ]))))
    }
}

struct LedgerSource;

impl ResourceSource for LedgerSource {
    fn load(&self, _handle: ResourceHandle) -> Result<Loaded, Failure> {
        Ok(Loaded::ready(Ledger::default()))
    }

    fn release(&self, object: ResourceObject) {
        if let Ok(ledger) = object.downcast::<Ledger>() {
            log::debug!("ledger closed with {} entries", ledger.entries().len());
        }
    }
}

/// Conecta em segundo plano; o job espera até o handle ficar pronto.
struct GatewaySource {
    latency: Duration,
}

impl ResourceSource for GatewaySource {
    fn load(&self, handle: ResourceHandle) -> Result<Loaded, Failure> {
        let latency = self.latency;
        thread::Builder::new()
            .name("gateway-connect".into())
            .spawn(move || {
                thread::sleep(latency);
                handle.ready(Gateway { latency });
            })
            .map_err(|e| Failure::new("gateway.connect", e.to_string()))?;
        Ok(Loaded::Pending)
    }
}

fn order_id(ctx: &JobContext) -> u64 {
    ctx.parameter()
        .value()
        .and_then(|v| v.get("id"))
        .and_then(Value::as_u64)
        .unwrap_or_default()
}

fn receive(ctx: &mut JobContext) -> Result<Outcome, Failure> {
    let orders = ctx
        .parameter()
        .value()
        .and_then(|v| v.get("orders"))
        .and_then(Value::as_u64)
        .ok_or_else(|| Failure::new("order.invalid", "parameter must carry `orders`"))?;
    for id in 0..orders {
        let order = ctx.asynchronous("process_order", json!({ "id": id }))?;
        ctx.join(&order, Some(Duration::from_secs(30)), Some(json!(id)));
    }
    ctx.sequential("summarize", Parameter::None)?;
    Ok(Outcome::value(json!({ "orders": orders })))
}

fn process_order(ctx: &mut JobContext) -> Result<Outcome, Failure> {
    let id = order_id(ctx);
    let catalog = ctx.resource::<Catalog>("catalog")?;
    let skus = ["book", "lamp", "mug"];
    let sku = skus[(id as usize) % skus.len()];
    let quantity = id % 3 + 1;
    let price = catalog
        .0
        .get(sku)
        .copied()
        .ok_or_else(|| Failure::new("order.unknown_sku", sku))?;
    let amount = price * quantity;

    let order = json!({ "id": id, "sku": sku, "quantity": quantity, "amount_cents": amount });
    ctx.parallel("reserve_stock", order.clone())?;
    Ok(Outcome::value(order))
}

fn amount(ctx: &JobContext) -> u64 {
    ctx.parameter()
        .value()
        .and_then(|v| v.get("amount_cents"))
        .and_then(Value::as_u64)
        .unwrap_or_default()
}

fn reserve_stock(ctx: &mut JobContext) -> Result<Outcome, Failure> {
    let ledger = ctx.resource::<Ledger>("ledger")?;
    ledger.record(order_id(ctx), "reserved", 0);
    Ok(Outcome::done())
}

fn charge(ctx: &mut JobContext) -> Result<Outcome, Failure> {
    let id = order_id(ctx);
    let gateway = ctx.resource::<Gateway>("gateway")?;
    if id % DECLINE_EVERY == DECLINE_EVERY - 1 {
        return Err(Failure::new(
            "payment.declined",
            format!("order {id} declined after {:?}", gateway.latency),
        ));
    }
    let ledger = ctx.resource::<Ledger>("ledger")?;
    ledger.record(id, "charged", amount(ctx));
    Ok(Outcome::done())
}

fn refund(ctx: &mut JobContext) -> Result<Outcome, Failure> {
    let ledger = ctx.resource::<Ledger>("ledger")?;
    let failure = ctx
        .failure()
        .cloned()
        .ok_or_else(|| Failure::new("refund.invalid", "no failure to refund"))?;
    log::info!("refunding: {failure}");
    let id = failure
        .message
        .split_whitespace()
        .nth(1)
        .and_then(|n| n.parse().ok())
        .unwrap_or_default();
    ledger.record(id, "refunded", 0);
    Ok(Outcome::done())
}

fn summarize(ctx: &mut JobContext) -> Result<Outcome, Failure> {
    let ledger = ctx.resource::<Ledger>("ledger")?;
    let entries = ledger.entries();
    let count = |event: &str| entries.iter().filter(|e| e.event == event).count();
    let revenue: u64 = entries
        .iter()
        .filter(|e| e.event == "charged")
        .map(|e| e.amount_cents)
        .sum();
    Ok(Outcome::value(json!({
        "reserved": count("reserved"),
        "charged": count("charged"),
        "refunded": count("refunded"),
        "revenue_cents": revenue,
    })))
}

/// Monta o grafo do pipeline usando o team configurado no engine.
pub fn graph(engine: &Engine, gateway_latency: Duration) -> Result<Arc<ProcessGraph>, EngineError> {
    engine
        .builder()
        .resource(ResourceSpec::new("catalog", ResourceScope::Process, Arc::new(CatalogSource)))
        .resource(ResourceSpec::new("ledger", ResourceScope::Process, Arc::new(LedgerSource)))
        .resource(
            ResourceSpec::new(
                "gateway",
                ResourceScope::Invocation,
                Arc::new(GatewaySource {
                    latency: gateway_latency,
                }),
            )
            .ready_timeout(Duration::from_secs(10)),
        )
        .job(JobSpec::new(ENTRY, receive))
        .job(
            JobSpec::new("process_order", process_order)
                .requires("catalog")
                .next("charge"),
        )
        .job(JobSpec::new("reserve_stock", reserve_stock).requires("ledger"))
        .job(
            JobSpec::new("charge", charge)
                .requires("gateway")
                .requires("ledger")
                .escalate("payment", "refund"),
        )
        .job(JobSpec::new("refund", refund).requires("ledger"))
        .job(JobSpec::new("summarize", summarize).requires("ledger"))
        .build()
}
