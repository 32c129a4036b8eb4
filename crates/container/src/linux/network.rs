//! Bridge and veth networking for native Linux containers.
//!
//! The host side owns one bridge; each container gets a veth pair with the
//! peer moved into the container's network namespace and addressed from the
//! bridge subnet. Outbound traffic is masqueraded through an iptables NAT
//! rule. DNS reaches the guest as a resolv.conf written by the bundle
//! writer.

use common::{Error, Result};
use futures_util::stream::TryStreamExt;
use getset::{CopyGetters, Getters};
use log::{debug, trace, warn};
use rtnetlink::Handle;
use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    net::{IpAddr, Ipv4Addr},
    os::unix::io::AsRawFd,
};
use tokio::process::Command;

/// Name of the container bridge on the host.
pub const BRIDGE_NAME: &str = "containerv0";

/// Gateway address carried by the bridge.
pub const BRIDGE_ADDR: Ipv4Addr = Ipv4Addr::new(172, 30, 0, 1);

/// Prefix length of the container subnet.
pub const SUBNET_PREFIX: u8 = 16;

/// The container subnet in CIDR notation.
pub const SUBNET: &str = "172.30.0.0/16";

#[derive(Debug, CopyGetters, Getters)]
/// One realised network attachment.
pub struct NetworkAttachment {
    #[get = "pub"]
    /// Host-side veth interface name.
    veth_host: String,

    #[get_copy = "pub"]
    /// Address assigned to the container end.
    container_addr: Ipv4Addr,
}

/// Attach a container to the bridge network.
pub async fn attach(id: &str, init_pid: u32) -> Result<NetworkAttachment> {
    let (connection, handle, _) = rtnetlink::new_connection()
        .map_err(|e| Error::from_io("create netlink connection", e))?;
    tokio::spawn(connection);

    ensure_bridge(&handle).await?;

    let veth_host = veth_host_name(id);
    let veth_guest = format!("{}g", veth_host);
    debug!(
        "Creating veth pair {} <-> {} for container {}",
        veth_host, veth_guest, id
    );
    handle
        .link()
        .add()
        .veth(veth_host.clone(), veth_guest.clone())
        .execute()
        .await
        .map_err(|e| Error::io(format!("create veth pair: {}", e)))?;

    let host_index = link_index(&handle, &veth_host).await?;
    let guest_index = link_index(&handle, &veth_guest).await?;
    let bridge_index = link_index(&handle, BRIDGE_NAME).await?;

    handle
        .link()
        .set(host_index)
        .master(bridge_index)
        .execute()
        .await
        .map_err(|e| Error::io(format!("enslave {} to bridge: {}", veth_host, e)))?;
    handle
        .link()
        .set(host_index)
        .up()
        .execute()
        .await
        .map_err(|e| Error::io(format!("set {} up: {}", veth_host, e)))?;
    handle
        .link()
        .set(guest_index)
        .setns_by_pid(init_pid)
        .execute()
        .await
        .map_err(|e| Error::io(format!("move {} into netns: {}", veth_guest, e)))?;

    let container_addr = container_addr(id);
    configure_guest(init_pid, &veth_guest, container_addr).await?;

    if let Err(e) = ensure_masquerade().await {
        warn!("NAT setup failed, container has bridge-only reachability: {}", e);
    }

    Ok(NetworkAttachment {
        veth_host,
        container_addr,
    })
}

/// Best-effort detach: the veth pair dies with its host end, the namespace
/// with the container init. The bridge and the shared NAT rule stay.
pub async fn detach(attachment: NetworkAttachment) {
    let connection = match rtnetlink::new_connection() {
        Ok((connection, handle, _)) => {
            tokio::spawn(connection);
            handle
        }
        Err(e) => {
            warn!("Netlink connection during detach failed: {}", e);
            return;
        }
    };

    match link_index(&connection, attachment.veth_host()).await {
        Ok(index) => {
            if let Err(e) = connection.link().del(index).execute().await {
                warn!("Deleting {} failed: {}", attachment.veth_host(), e);
            }
        }
        Err(e) => trace!(
            "Host veth {} already gone: {}",
            attachment.veth_host(),
            e
        ),
    }
}

/// Create the bridge when missing, address it and bring it up.
async fn ensure_bridge(handle: &Handle) -> Result<()> {
    if link_index(handle, BRIDGE_NAME).await.is_ok() {
        return Ok(());
    }
    debug!("Creating container bridge {}", BRIDGE_NAME);

    handle
        .link()
        .add()
        .bridge(BRIDGE_NAME.to_string())
        .execute()
        .await
        .map_err(|e| Error::io(format!("create bridge {}: {}", BRIDGE_NAME, e)))?;

    let index = link_index(handle, BRIDGE_NAME).await?;
    handle
        .address()
        .add(index, IpAddr::V4(BRIDGE_ADDR), SUBNET_PREFIX)
        .execute()
        .await
        .map_err(|e| Error::io(format!("address bridge {}: {}", BRIDGE_NAME, e)))?;
    handle
        .link()
        .set(index)
        .up()
        .execute()
        .await
        .map_err(|e| Error::io(format!("set bridge {} up: {}", BRIDGE_NAME, e)))
}

/// Get a link index by name.
async fn link_index(handle: &Handle, name: &str) -> Result<u32> {
    let link = handle
        .link()
        .get()
        .set_name_filter(name.to_string())
        .execute()
        .try_next()
        .await
        .map_err(|e| Error::io(format!("get link {}: {}", name, e)))?
        .ok_or_else(|| Error::not_found(format!("no link named {}", name)))?;
    Ok(link.header.index)
}

/// Configure the guest end inside the container's network namespace: bring
/// lo and the veth up, address it and install the default route. Netlink
/// sockets bind to the namespace they are created in, so this runs on a
/// scratch thread that switches namespaces around the work.
async fn configure_guest(init_pid: u32, veth_guest: &str, addr: Ipv4Addr) -> Result<()> {
    use futures::future::Either;

    let target = std::fs::File::open(format!("/proc/{}/ns/net", init_pid))
        .map_err(|e| Error::from_io("open container netns", e))?;
    let current = std::fs::File::open("/proc/thread-self/ns/net")
        .map_err(|e| Error::from_io("open host netns", e))?;
    let veth_guest = veth_guest.to_string();

    tokio::task::spawn_blocking(move || {
        nix::sched::setns(target.as_raw_fd(), nix::sched::CloneFlags::CLONE_NEWNET)
            .map_err(|e| Error::io(format!("enter container netns: {}", e)))?;

        let result = futures::executor::block_on(async {
            let (connection, handle, _) = rtnetlink::new_connection()
                .map_err(|e| Error::from_io("create in-namespace netlink connection", e))?;
            futures::pin_mut!(connection);

            let ops = async {
                let lo = link_index(&handle, "lo").await?;
                handle
                    .link()
                    .set(lo)
                    .up()
                    .execute()
                    .await
                    .map_err(|e| Error::io(format!("set lo up: {}", e)))?;

                let guest = link_index(&handle, &veth_guest).await?;
                handle
                    .address()
                    .add(guest, IpAddr::V4(addr), SUBNET_PREFIX)
                    .execute()
                    .await
                    .map_err(|e| Error::io(format!("address {}: {}", veth_guest, e)))?;
                handle
                    .link()
                    .set(guest)
                    .up()
                    .execute()
                    .await
                    .map_err(|e| Error::io(format!("set {} up: {}", veth_guest, e)))?;
                handle
                    .route()
                    .add()
                    .v4()
                    .gateway(BRIDGE_ADDR)
                    .execute()
                    .await
                    .map_err(|e| Error::io(format!("default route: {}", e)))
            };
            futures::pin_mut!(ops);

            match futures::future::select(connection, ops).await {
                Either::Left(_) => Err(Error::io("netlink connection ended early")),
                Either::Right((result, _)) => result,
            }
        });

        // Always return to the host namespace, even on failure.
        let back = nix::sched::setns(current.as_raw_fd(), nix::sched::CloneFlags::CLONE_NEWNET)
            .map_err(|e| Error::io(format!("return to host netns: {}", e)));
        result.and(back)
    })
    .await
    .map_err(|e| Error::io(format!("namespace thread: {}", e)))?
}

/// Install the shared POSTROUTING masquerade rule when absent.
async fn ensure_masquerade() -> Result<()> {
    let iptables =
        which::which("iptables").map_err(|e| Error::not_found(format!("iptables: {}", e)))?;

    let check = Command::new(&iptables)
        .args(masquerade_rule_args("-C"))
        .output()
        .await
        .map_err(|e| Error::from_io("run iptables", e))?;
    if check.status.success() {
        return Ok(());
    }

    let append = Command::new(&iptables)
        .args(masquerade_rule_args("-A"))
        .output()
        .await
        .map_err(|e| Error::from_io("run iptables", e))?;
    if !append.status.success() {
        return Err(Error::io(format!(
            "iptables masquerade rule: {}",
            String::from_utf8_lossy(&append.stderr).trim()
        )));
    }
    Ok(())
}

/// Arguments of the masquerade rule for the provided table operation.
fn masquerade_rule_args(operation: &str) -> Vec<String> {
    [
        "-t",
        "nat",
        operation,
        "POSTROUTING",
        "-s",
        SUBNET,
        "!",
        "-o",
        BRIDGE_NAME,
        "-j",
        "MASQUERADE",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Host-side veth name for a container id.
fn veth_host_name(id: &str) -> String {
    format!("cv{}", &id[..id.len().min(8)])
}

/// Deterministic container address inside the subnet, keeping clear of the
/// network, gateway and broadcast addresses.
fn container_addr(id: &str) -> Ipv4Addr {
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    let hash = hasher.finish();

    let octet3 = (hash >> 8) as u8;
    let mut octet4 = hash as u8;
    if octet3 == 0 && (octet4 == 0 || octet4 == 1) {
        octet4 = 2;
    }
    if octet3 == 255 && octet4 == 255 {
        octet4 = 254;
    }
    Ipv4Addr::new(172, 30, octet3, octet4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn veth_names_are_short_and_stable() {
        assert_eq!(veth_host_name("0123456789ab"), "cv01234567");
        assert_eq!(veth_host_name("ab"), "cvab");
        assert_eq!(veth_host_name("0123456789ab"), veth_host_name("0123456789ab"));
    }

    #[test]
    fn container_addr_is_deterministic_and_valid() {
        let first = container_addr("0123456789ab");
        let second = container_addr("0123456789ab");
        assert_eq!(first, second);

        for id in ["a", "b", "c", "0123456789ab", "deadbeef0123"] {
            let addr = container_addr(id);
            assert_eq!(addr.octets()[0], 172);
            assert_eq!(addr.octets()[1], 30);
            assert_ne!(addr, BRIDGE_ADDR);
            assert_ne!(addr, Ipv4Addr::new(172, 30, 0, 0));
            assert_ne!(addr, Ipv4Addr::new(172, 30, 255, 255));
        }
    }

    #[test]
    fn masquerade_rule_shape() {
        let args = masquerade_rule_args("-A");
        assert_eq!(args[0], "-t");
        assert_eq!(args[1], "nat");
        assert_eq!(args[2], "-A");
        assert!(args.contains(&SUBNET.to_string()));
        assert!(args.contains(&"MASQUERADE".to_string()));
    }

    #[tokio::test]
    async fn loopback_lookup() -> Result<()> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);
        let index = link_index(&handle, "lo").await?;
        assert!(index > 0);
        Ok(())
    }
}
