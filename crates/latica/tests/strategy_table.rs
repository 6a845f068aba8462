/// The full (local, remote) connection strategy table.
use latica::{connection_strategy, NatType, Strategy};

const UNR: NatType = NatType::UNRESTRICTED;
const ADR: NatType = NatType::ADDR_RESTRICTED;
const PRT: NatType = NatType::PORT_RESTRICTED;
const END: NatType = NatType::ENDPOINT_RESTRICTED;

#[test]
fn strategy_for_every_known_pair() {
    use Strategy::*;

    // rows: remote, columns: local
    let table = [
        (UNR, [DirectConnect, DirectConnect, DirectConnect, DirectConnect]),
        (ADR, [Defer, DirectConnect, DirectConnect, DirectConnect]),
        (PRT, [Defer, DirectConnect, DirectConnect, TraversalConnect]),
        (END, [Defer, DirectConnect, TraversalOpen, Proxy]),
    ];
    let locals = [UNR, ADR, PRT, END];

    for (remote, row) in table {
        for (local, expected) in locals.iter().zip(row) {
            assert_eq!(
                connection_strategy(*local, remote),
                expected,
                "local {local}, remote {remote}"
            );
        }
    }
}

#[test]
fn unknown_types_fall_back_to_proxy() {
    assert_eq!(connection_strategy(NatType::UNKNOWN, PRT), Strategy::Proxy);
    assert_eq!(connection_strategy(PRT, NatType::UNKNOWN), Strategy::Proxy);
    // an unrestricted remote is reachable whatever we are
    assert_eq!(connection_strategy(NatType::UNKNOWN, UNR), Strategy::DirectConnect);
}

#[test]
fn strategy_names() {
    assert_eq!(Strategy::TraversalOpen.to_string(), "STRATEGY_TRAVERSAL_OPEN");
    assert_eq!(Strategy::Defer.to_string(), "STRATEGY_DEFER");
}
