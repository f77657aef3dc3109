/// Conventional TCP service names, sorted by port.
const WELL_KNOWN: &[(u16, &str)] = &[
    (21, "ftp"),
    (22, "ssh"),
    (23, "telnet"),
    (25, "smtp"),
    (53, "domain"),
    (80, "http"),
    (110, "pop3"),
    (111, "rpcbind"),
    (135, "msrpc"),
    (139, "netbios-ssn"),
    (143, "imap"),
    (389, "ldap"),
    (443, "https"),
    (445, "microsoft-ds"),
    (465, "smtps"),
    (587, "submission"),
    (636, "ldaps"),
    (873, "rsync"),
    (993, "imaps"),
    (995, "pop3s"),
    (1194, "openvpn"),
    (1433, "ms-sql-s"),
    (1521, "oracle"),
    (2049, "nfs"),
    (2181, "zookeeper"),
    (2375, "docker"),
    (2376, "docker-s"),
    (3306, "mysql"),
    (3389, "ms-wbt-server"),
    (5432, "postgresql"),
    (5601, "kibana"),
    (5672, "amqp"),
    (5900, "vnc"),
    (5984, "couchdb"),
    (6379, "redis"),
    (6443, "kubernetes-api"),
    (8080, "http-proxy"),
    (8443, "https-alt"),
    (9092, "kafka"),
    (9200, "elasticsearch"),
    (11211, "memcache"),
    (27017, "mongod"),
];

/// Label for a report line, if the port has a conventional service.
pub fn get_service_name(port: u16) -> Option<&'static str> {
    WELL_KNOWN
        .binary_search_by_key(&port, |(p, _)| *p)
        .ok()
        .map(|idx| WELL_KNOWN[idx].1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_sorted() {
        assert!(WELL_KNOWN.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_known_and_unknown() {
        assert_eq!(get_service_name(22), Some("ssh"));
        assert_eq!(get_service_name(1194), Some("openvpn"));
        assert_eq!(get_service_name(3306), Some("mysql"));
        assert_eq!(get_service_name(27017), Some("mongod"));
        assert_eq!(get_service_name(29999), None);
    }
}
