//! Reconciles the three upstream sources into the per-tenant product model.
//!
//! Inputs: aggregates (authoritative totals), warehouse breakdown (FBO
//! detail only), and raw order records. Output: products with per-warehouse
//! rows, a synthesized seller-fulfilled residual where the FBO detail does
//! not cover the authoritative total, and warnings where the sources
//! disagree the other way. This stage never fails for data reasons.

use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use crate::marketplace::types::{OrderRecord, ProductAggregate, WarehouseRemains};
use crate::models::{Fulfillment, Product, Warehouse};

/// Synthesized row carrying stock held on the seller's own premises.
pub const FBS_RESIDUAL_WAREHOUSE: &str = "МП/FBS (on seller's premises)";

/// Logistics buckets that are in-transit states, not inventory.
pub const RESERVED_BUCKETS: [&str; 2] = ["В пути до получателей", "На возврате от покупателя"];

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub products: Vec<Product>,
    pub warnings: Vec<String>,
    pub orders_fetched_raw: u32,
    pub orders_after_filter: u32,
}

fn is_reserved_bucket(name: &str) -> bool {
    RESERVED_BUCKETS.contains(&name)
}

struct ProductBuild {
    vendor_code: String,
    name: String,
    total_stock: u32,
    /// Ordered by warehouse name for a deterministic projection.
    warehouses: BTreeMap<String, Warehouse>,
}

pub fn merge(
    aggregates: &[ProductAggregate],
    breakdown: &[WarehouseRemains],
    orders: &[OrderRecord],
) -> MergeOutcome {
    let mut warnings: Vec<String> = Vec::new();

    // 1. Orders preprocessing: drop cancelled, dedupe by srid, then count
    //    per (nmId, warehouse). Reserved buckets never count as warehouses.
    let orders_fetched_raw = orders.len() as u32;
    let mut seen_srids: HashSet<&str> = HashSet::with_capacity(orders.len());
    let mut orders_after_filter: u32 = 0;
    let mut order_counts: BTreeMap<(i64, String), u32> = BTreeMap::new();

    for order in orders {
        if order.is_cancel {
            continue;
        }
        if !seen_srids.insert(order.srid.as_str()) {
            continue;
        }
        orders_after_filter += 1;
        if is_reserved_bucket(&order.warehouse_name) {
            continue;
        }
        *order_counts
            .entry((order.nm_id, order.warehouse_name.clone()))
            .or_insert(0) += 1;
    }

    let mut builds: BTreeMap<i64, ProductBuild> = BTreeMap::new();

    // 2. Aggregates define the product set and the authoritative totals;
    //    catalog fields from A win over W.
    for agg in aggregates {
        builds.insert(
            agg.nm_id,
            ProductBuild {
                vendor_code: agg.vendor_code.clone(),
                name: agg.title.clone(),
                total_stock: agg.metrics.stock_count,
                warehouses: BTreeMap::new(),
            },
        );
    }

    // 3. Seed FBO warehouses from the breakdown. Products only seen in the
    //    breakdown fall back to the FBO sum as their total.
    for remains in breakdown {
        let build = builds.entry(remains.nm_id).or_insert_with(|| ProductBuild {
            vendor_code: remains.vendor_code.clone(),
            name: String::new(),
            total_stock: remains
                .warehouses
                .iter()
                .filter(|w| !is_reserved_bucket(&w.name))
                .map(|w| w.quantity)
                .sum(),
            warehouses: BTreeMap::new(),
        });

        for wh in &remains.warehouses {
            if is_reserved_bucket(&wh.name) {
                continue;
            }
            // W wins warehouse name strings; last write per name is fine
            // since the breakdown has one row per (product, warehouse).
            build.warehouses.insert(
                wh.name.clone(),
                Warehouse {
                    name: wh.name.clone(),
                    fulfillment: Fulfillment::Fbo,
                    stock: wh.quantity,
                    orders: 0,
                },
            );
        }
    }

    // 4. Inject order counts; a missing warehouse row means stock ran out
    //    (or the order shipped from the seller's premises) — it still must
    //    appear, with zero stock.
    for ((nm_id, warehouse_name), count) in &order_counts {
        let build = builds.entry(*nm_id).or_insert_with(|| {
            debug!(nm_id, "Orders reference a product absent from both sources");
            ProductBuild {
                vendor_code: String::new(),
                name: String::new(),
                total_stock: 0,
                warehouses: BTreeMap::new(),
            }
        });

        build
            .warehouses
            .entry(warehouse_name.clone())
            .and_modify(|w| w.orders = *count)
            .or_insert_with(|| Warehouse {
                name: warehouse_name.clone(),
                fulfillment: Fulfillment::Synthetic,
                stock: 0,
                orders: *count,
            });
    }

    // 5/6. Authoritative total, FBS residual, total orders.
    let now = Utc::now();
    let mut products = Vec::with_capacity(builds.len());

    for (nm_id, mut build) in builds {
        let fbo_sum: u32 = build
            .warehouses
            .values()
            .filter(|w| w.fulfillment == Fulfillment::Fbo)
            .map(|w| w.stock)
            .sum();

        if build.total_stock > fbo_sum {
            build.warehouses.insert(
                FBS_RESIDUAL_WAREHOUSE.to_string(),
                Warehouse {
                    name: FBS_RESIDUAL_WAREHOUSE.to_string(),
                    fulfillment: Fulfillment::Fbs,
                    stock: build.total_stock - fbo_sum,
                    orders: 0,
                },
            );
        } else if build.total_stock < fbo_sum {
            warnings.push(format!(
                "reconciliation_mismatch: nm {} aggregate total {} below fbo sum {}",
                nm_id, build.total_stock, fbo_sum
            ));
        }

        let total_orders: u32 = build.warehouses.values().map(|w| w.orders).sum();

        products.push(Product {
            nm_id,
            vendor_code: build.vendor_code,
            name: build.name,
            total_stock: build.total_stock,
            total_orders,
            warehouses: build.warehouses.into_values().collect(),
            updated_at: now,
        });
    }

    MergeOutcome {
        products,
        warnings,
        orders_fetched_raw,
        orders_after_filter,
    }
}
