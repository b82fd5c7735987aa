use slog::{o, Drain, Logger};

/// Build this replica's root logger: an async, terminal-formatted `slog`
/// drain tagged with the cluster name and node id, so every downstream
/// `info!`/`warn!` call carries that context without repeating it.
pub(crate) fn root_logger(cluster_name: &str, node_id: u64) -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!("cluster" => cluster_name.to_string(), "node_id" => node_id))
}
