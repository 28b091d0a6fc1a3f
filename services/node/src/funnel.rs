//! Public ingress ("funnel") eligibility.

use crate::backend::{SelfNode, CAP_FUNNEL, CAP_HTTPS};
use crate::error::Error;
use crate::registry::ListenOn;

/// Ports funnel may use when the control plane does not say otherwise.
pub const DEFAULT_FUNNEL_PORTS: [u16; 3] = [443, 8443, 10000];

/// Which traffic classes a funnel listener receives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FunnelMode {
    /// Public ingress and the private overlay.
    #[default]
    TailnetAndFunnel,
    /// Public ingress only.
    FunnelOnly,
}

impl FunnelMode {
    pub(crate) fn listen_on(self) -> ListenOn {
        match self {
            FunnelMode::TailnetAndFunnel => ListenOn::Both,
            FunnelMode::FunnelOnly => ListenOn::Funnel,
        }
    }
}

/// Check that `node` may serve funnel traffic on `port`.
pub fn check_funnel_access(port: u16, node: &SelfNode) -> Result<(), Error> {
    if !node.has_capability(CAP_HTTPS) {
        return Err(Error::FunnelDenied(
            "HTTPS is not enabled for this node".into(),
        ));
    }
    if !node.has_capability(CAP_FUNNEL) {
        return Err(Error::FunnelDenied("funnel is not enabled for this node".into()));
    }

    let allowed = match &node.funnel_ports {
        Some(ports) => ports.contains(&port),
        None => DEFAULT_FUNNEL_PORTS.contains(&port),
    };
    if !allowed {
        return Err(Error::FunnelDenied(format!(
            "port {port} is not allowed for funnel"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn node(caps: &[&str], ports: Option<Vec<u16>>) -> SelfNode {
        SelfNode {
            hostname: "web".into(),
            dns_name: "web.example.ts.net".into(),
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            funnel_ports: ports,
        }
    }

    #[rstest]
    #[case(443)]
    #[case(8443)]
    #[case(10000)]
    fn test_default_ports_allowed(#[case] port: u16) {
        assert!(check_funnel_access(port, &node(&[CAP_HTTPS, CAP_FUNNEL], None)).is_ok());
    }

    #[test]
    fn test_other_port_denied() {
        let err = check_funnel_access(80, &node(&[CAP_HTTPS, CAP_FUNNEL], None)).unwrap_err();
        assert!(err.to_string().contains("port 80"));
    }

    #[test]
    fn test_capabilities_required() {
        assert!(check_funnel_access(443, &node(&[CAP_FUNNEL], None)).is_err());
        assert!(check_funnel_access(443, &node(&[CAP_HTTPS], None)).is_err());
    }

    #[test]
    fn test_control_plane_port_list() {
        let n = node(&[CAP_HTTPS, CAP_FUNNEL], Some(vec![8443]));
        assert!(check_funnel_access(8443, &n).is_ok());
        assert!(check_funnel_access(443, &n).is_err());
    }

    #[test]
    fn test_mode_keys() {
        assert_eq!(FunnelMode::default().listen_on(), ListenOn::Both);
        assert_eq!(FunnelMode::FunnelOnly.listen_on(), ListenOn::Funnel);
    }
}
