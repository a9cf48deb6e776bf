use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntGauge, TextEncoder};
use std::sync::OnceLock;

static ACCEPTED: OnceLock<IntCounter> = OnceLock::new();
static REJECTED: OnceLock<IntCounter> = OnceLock::new();
static DUPLICATES: OnceLock<IntCounter> = OnceLock::new();
static BANS: OnceLock<IntCounter> = OnceLock::new();
static VARDIFF_RETARGETS: OnceLock<IntCounter> = OnceLock::new();
static JOB_BROADCASTS: OnceLock<IntCounter> = OnceLock::new();
static HTTP_PROBES: OnceLock<IntCounter> = OnceLock::new();
static BLOCKS_FOUND: OnceLock<IntCounter> = OnceLock::new();
static BLOCK_SUBMIT_REJECTED: OnceLock<IntCounter> = OnceLock::new();
static RPC_REQUESTS: OnceLock<IntCounter> = OnceLock::new();
static RPC_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static TEMPLATE_UPDATES: OnceLock<IntCounter> = OnceLock::new();
static TEMPLATE_FETCH_ERRORS: OnceLock<IntCounter> = OnceLock::new();

static ACTIVE_CONNECTIONS: OnceLock<IntGauge> = OnceLock::new();

fn accepted() -> &'static IntCounter {
    ACCEPTED.get_or_init(|| {
        IntCounter::new("shares_accepted_total", "Total accepted shares").unwrap()
    })
}

fn rejected() -> &'static IntCounter {
    REJECTED.get_or_init(|| {
        IntCounter::new("shares_rejected_total", "Total rejected shares").unwrap()
    })
}

fn duplicates() -> &'static IntCounter {
    DUPLICATES.get_or_init(|| {
        IntCounter::new("shares_duplicate_total", "Total duplicate shares").unwrap()
    })
}

fn bans() -> &'static IntCounter {
    BANS.get_or_init(|| {
        IntCounter::new("connections_banned_total", "Connections banned by score").unwrap()
    })
}

fn vardiff_retargets() -> &'static IntCounter {
    VARDIFF_RETARGETS.get_or_init(|| {
        IntCounter::new("vardiff_retargets_total", "Total vardiff retargets staged").unwrap()
    })
}

fn job_broadcasts() -> &'static IntCounter {
    JOB_BROADCASTS.get_or_init(|| {
        IntCounter::new("job_broadcasts_total", "Total job broadcasts").unwrap()
    })
}

fn http_probes() -> &'static IntCounter {
    HTTP_PROBES.get_or_init(|| {
        IntCounter::new(
            "http_probes_redirected_total",
            "HTTP requests redirected off the stratum port",
        )
        .unwrap()
    })
}

fn blocks_found() -> &'static IntCounter {
    BLOCKS_FOUND.get_or_init(|| {
        IntCounter::new("blocks_found_total", "Blocks accepted upstream").unwrap()
    })
}

fn block_submit_rejected() -> &'static IntCounter {
    BLOCK_SUBMIT_REJECTED.get_or_init(|| {
        IntCounter::new(
            "block_submit_rejected_total",
            "Winning proofs the upstream node rejected",
        )
        .unwrap()
    })
}

fn rpc_requests() -> &'static IntCounter {
    RPC_REQUESTS.get_or_init(|| {
        IntCounter::new("rpc_requests_total", "Upstream RPC requests").unwrap()
    })
}

fn rpc_errors() -> &'static IntCounter {
    RPC_ERRORS.get_or_init(|| IntCounter::new("rpc_errors_total", "Upstream RPC errors").unwrap())
}

fn template_updates() -> &'static IntCounter {
    TEMPLATE_UPDATES.get_or_init(|| {
        IntCounter::new("template_updates_total", "New work templates adopted").unwrap()
    })
}

fn template_fetch_errors() -> &'static IntCounter {
    TEMPLATE_FETCH_ERRORS.get_or_init(|| {
        IntCounter::new("template_fetch_errors_total", "Failed template fetches").unwrap()
    })
}

fn active_connections() -> &'static IntGauge {
    ACTIVE_CONNECTIONS.get_or_init(|| {
        IntGauge::new("active_connections", "Currently connected miners").unwrap()
    })
}

pub fn inc_accepted() {
    accepted().inc();
}

pub fn inc_rejected() {
    rejected().inc();
}

pub fn inc_duplicates() {
    duplicates().inc();
}

pub fn inc_bans() {
    bans().inc();
}

pub fn inc_vardiff_retarget() {
    vardiff_retargets().inc();
}

pub fn inc_job_broadcasts() {
    job_broadcasts().inc();
}

pub fn inc_http_probes() {
    http_probes().inc();
}

pub fn inc_blocks_found() {
    blocks_found().inc();
}

pub fn inc_block_submit_rejected() {
    block_submit_rejected().inc();
}

pub fn inc_rpc_requests() {
    rpc_requests().inc();
}

pub fn inc_rpc_errors() {
    rpc_errors().inc();
}

pub fn inc_template_updates() {
    template_updates().inc();
}

pub fn inc_template_fetch_errors() {
    template_fetch_errors().inc();
}

pub fn inc_connections() {
    active_connections().inc();
}

pub fn dec_connections() {
    active_connections().dec();
}

pub fn render() -> String {
    let enc = TextEncoder::new();
    let mut mfs = Vec::new();

    mfs.extend(accepted().collect());
    mfs.extend(rejected().collect());
    mfs.extend(duplicates().collect());
    mfs.extend(bans().collect());
    mfs.extend(vardiff_retargets().collect());
    mfs.extend(job_broadcasts().collect());
    mfs.extend(http_probes().collect());
    mfs.extend(blocks_found().collect());
    mfs.extend(block_submit_rejected().collect());
    mfs.extend(rpc_requests().collect());
    mfs.extend(rpc_errors().collect());
    mfs.extend(template_updates().collect());
    mfs.extend(template_fetch_errors().collect());
    mfs.extend(active_connections().collect());

    let mut buf = Vec::new();
    let _ = enc.encode(&mfs, &mut buf);
    String::from_utf8_lossy(&buf).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_counters() {
        inc_accepted();
        inc_duplicates();
        let out = render();
        assert!(out.contains("shares_accepted_total"));
        assert!(out.contains("shares_duplicate_total"));
        assert!(out.contains("active_connections"));
    }
}
