//! Seed demo data: a user, a few example scripts, a `sales` source
//! table, and one pending job ready for the worker to pick up.

use envconfig::Envconfig;
use polars::prelude::*;
use tracing::info;

use transform_common::datastore::{DataStore, WriteMode};
use transform_common::queue::{NewJob, QueueManager};
use transform_worker::config::Config;

const ADD_TOTAL_COLUMN: &str = "\
df[\"total\"] = df[\"price\"] * df[\"qty\"]
return df
";

const FILTER_BIG_ORDERS: &str = "\
return df[df[\"total_value\"] > 100]
";

const CLEAN_NULLS: &str = "\
df[\"qty\"] = df[\"qty\"].fillna(0)
return df
";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");
    let queue = QueueManager::connect(&config.database_url, config.max_pg_connections)
        .await
        .expect("failed to connect to the database");
    let pool = queue.pool().clone();

    let (user_id,): (i64,) = sqlx::query_as(
        r#"
INSERT INTO users (username, password_hash)
VALUES ('demo', 'not-a-real-hash')
ON CONFLICT (username) DO UPDATE SET username = EXCLUDED.username
RETURNING id
        "#,
    )
    .fetch_one(&pool)
    .await
    .expect("failed to seed the demo user");
    info!(user_id, "seeded demo user");

    let mut first_script_id = None;
    for (name, description, code) in [
        (
            "add_total_column",
            "Derive a total column from price and quantity",
            ADD_TOTAL_COLUMN,
        ),
        (
            "filter_big_orders",
            "Keep rows whose total value exceeds 100",
            FILTER_BIG_ORDERS,
        ),
        ("clean_nulls", "Replace missing quantities with zero", CLEAN_NULLS),
    ] {
        let (script_id,): (i64,) = sqlx::query_as(
            r#"
INSERT INTO scripts (user_id, name, description, code_text)
VALUES ($1, $2, $3, $4)
RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(name)
        .bind(description)
        .bind(code)
        .fetch_one(&pool)
        .await
        .expect("failed to seed script");
        info!(script_id, name, "seeded script");
        first_script_id.get_or_insert(script_id);
    }

    let store = DataStore::new(
        pool,
        config.sandbox_max_output_rows,
        config.chunk_size,
    );
    let sales = DataFrame::new(vec![
        Series::new("price".into(), &[10i64, 20, 30]).into_column(),
        Series::new("qty".into(), &[2i64, 3, 4]).into_column(),
    ])
    .expect("failed to build the sales frame");
    store
        .write_table(&sales, "sales", WriteMode::Replace)
        .await
        .expect("failed to seed the sales table");
    info!(rows = sales.height(), "seeded sales table");

    let job_id = queue
        .enqueue(NewJob {
            user_id,
            script_id: first_script_id,
            source_table: "sales".to_owned(),
            destination_table: "sales_out".to_owned(),
        })
        .await
        .expect("failed to enqueue the demo job");
    info!(job_id, "enqueued demo job; start transform-worker to run it");
}
