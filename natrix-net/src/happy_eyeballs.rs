use std::{io, net::SocketAddr, time::Duration};

use futures_util::{stream::FuturesUnordered, StreamExt};
use natrix_proto::{Host, ServerAddr};
use tokio::{
    net::{self, TcpStream},
    time,
};

const ATTEMPT_DELAY: Duration = Duration::from_millis(250);

/// Connects to an address and returns a [`TcpStream`].
///
/// Ip addresses are dialed directly. DNS hostnames are resolved and
/// dialed in the interleaved, staggered fashion of [Happy Eyeballs]:
/// address families alternate starting with IPv6, and a new attempt
/// is raced against the ones already in flight whenever the previous
/// attempt hasn't completed within a short delay. The first attempt
/// to connect wins.
///
/// [Happy Eyeballs]: https://en.wikipedia.org/wiki/Happy_Eyeballs
///
/// # Errors
///
/// It returns an error if it is not possible to connect to any host.
pub async fn connect(addr: &ServerAddr) -> io::Result<TcpStream> {
    match addr.host() {
        Host::Ip(ip) => TcpStream::connect(SocketAddr::new(*ip, addr.port())).await,
        Host::Dns(host) => {
            let host = <_ as AsRef<str>>::as_ref(host);
            let records = net::lookup_host(format!("{}:{}", host, addr.port())).await?;

            staggered_dial(interleave_address_families(records)).await
        }
    }
}

/// Alternate between address families, IPv6 first
///
/// The resolver's relative order is kept within each family.
fn interleave_address_families(records: impl Iterator<Item = SocketAddr>) -> Vec<SocketAddr> {
    let (v6, v4): (Vec<_>, Vec<_>) = records.partition(SocketAddr::is_ipv6);

    let mut interleaved = Vec::with_capacity(v6.len() + v4.len());
    let mut v6 = v6.into_iter();
    let mut v4 = v4.into_iter();
    loop {
        match (v6.next(), v4.next()) {
            (None, None) => break,
            (six, four) => {
                interleaved.extend(six);
                interleaved.extend(four);
            }
        }
    }

    interleaved
}

async fn staggered_dial(records: Vec<SocketAddr>) -> io::Result<TcpStream> {
    let mut records = records.into_iter();
    let mut attempts = FuturesUnordered::new();
    let mut last_err = None;

    loop {
        if attempts.is_empty() {
            let Some(record) = records.next() else {
                return Err(last_err.unwrap_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "could not resolve to any address",
                    )
                }));
            };
            attempts.push(TcpStream::connect(record));
        }

        tokio::select! {
            outcome = attempts.next() => match outcome {
                Some(Ok(conn)) => return Ok(conn),
                Some(Err(err)) => last_err = Some(err),
                None => {}
            },
            () = time::sleep(ATTEMPT_DELAY), if records.len() > 0 => {
                // A slow attempt keeps running; race the next record
                // against it instead of waiting for it to fail
                attempts.push(TcpStream::connect(
                    records.next().expect("guarded by records.len()"),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::interleave_address_families;

    fn records(raw: &[&str]) -> Vec<SocketAddr> {
        raw.iter().map(|r| r.parse().unwrap()).collect()
    }

    #[test]
    fn interleaves_starting_with_ipv6() {
        let interleaved = interleave_address_families(
            records(&[
                "1.1.1.1:4222",
                "[2606:4700::1]:4222",
                "8.8.8.8:4222",
                "[2001:4860::1]:4222",
                "9.9.9.9:4222",
            ])
            .into_iter(),
        );

        assert_eq!(
            records(&[
                "[2606:4700::1]:4222",
                "1.1.1.1:4222",
                "[2001:4860::1]:4222",
                "8.8.8.8:4222",
                "9.9.9.9:4222",
            ]),
            interleaved
        );
    }

    #[test]
    fn single_family_keeps_resolver_order() {
        let raw = records(&["1.1.1.1:4222", "8.8.8.8:4222", "9.9.9.9:4222"]);
        assert_eq!(
            raw.clone(),
            interleave_address_families(raw.into_iter())
        );
    }

    #[test]
    fn empty_resolution() {
        assert!(interleave_address_families(std::iter::empty()).is_empty());
    }
}
