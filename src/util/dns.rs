// DNS helpers
// (c) 2024 Ross Younger

use std::net::IpAddr;

use anyhow::Context as _;

/// Forward lookup helper. The first answer wins; an empty answer set is an
/// error, as is lookup failure.
pub fn resolve(host: &str) -> anyhow::Result<IpAddr> {
    let candidates = dns_lookup::lookup_host(host)
        .with_context(|| format!("host name lookup for {host} failed"))?;
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("host {host} did not resolve to any address"))
}

#[cfg(test)]
mod test {
    #[test]
    fn localhost_resolves() {
        let addr = super::resolve("localhost").unwrap();
        assert!(addr.is_loopback());
    }

    #[test]
    fn invalid_tld_fails() {
        assert!(super::resolve("nxdomain.invalid").is_err());
    }
}
