use std::io::{self, Write};

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use crate::cli::ProductsArgs;
use crate::config::AppConfig;
use crate::repository::create_repository;
use crate::util::write_json_stdout;

#[derive(Debug, Serialize)]
struct ProductListing {
    backend: String,
    products: Vec<String>,
}

pub fn run(args: ProductsArgs) -> Result<()> {
    let config = AppConfig::from_args(&args.source)?;
    let repository = create_repository(&config)?;
    let products = repository.list_products()?;

    if products.is_empty() {
        warn!(backend = %config.database.backend, "no products found");
    }
    info!(backend = %config.database.backend, products = products.len(), "listed products");

    let listing = ProductListing {
        backend: repository.backend().to_string(),
        products,
    };

    if args.json {
        return write_json_stdout(&listing);
    }

    let mut output = io::BufWriter::new(io::stdout().lock());
    for product in &listing.products {
        writeln!(output, "{product}")?;
    }
    output.flush()?;
    Ok(())
}
