// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::rule::{encode_bin, encode_rule, validate_action, validate_condition};
use super::*;
use crate::model::bin::BlockRef;
use crate::model::flow::{EncapFlow, EncapFlowParams, NshData};
use crate::model::group::{TunnelGroupParams, TunnelGroupParamsBuilder};
use crate::model::rule::Rule;
use crate::types::{FlowId, LookupType, TunnelType};

fn v6(last: u16) -> IpAddr {
    IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, last))
}

fn decap_group() -> TunnelGroupParams {
    TunnelGroupParamsBuilder::default().size(16).build().unwrap()
}

fn encap_group(tunnel_type: TunnelType) -> TunnelGroupParams {
    TunnelGroupParamsBuilder::default()
        .size(16)
        .encap(true)
        .tunnel_type(tunnel_type)
        .build()
        .unwrap()
}

fn vni_rule(id: u32, vni: u32) -> Rule {
    Rule {
        id,
        condition: TunnelCondition::VNI,
        cond_params: ConditionParams {
            vni,
            ..Default::default()
        },
        action: RuleAction::SET_DGLORT,
        action_params: RuleActionParams {
            dglort: 0x100 + u16::try_from(id).unwrap(),
            ..Default::default()
        },
        counter: None,
        lookup_bin: 0,
        data_pos: 0,
    }
}

fn encap_rule(id: u32, flow: FlowId) -> Rule {
    Rule {
        id,
        condition: TunnelCondition::DIP,
        cond_params: ConditionParams {
            dip: v6(id.try_into().unwrap()),
            ..Default::default()
        },
        action: RuleAction::ENCAP_FLOW | RuleAction::SET_VNI,
        action_params: RuleActionParams {
            encap_flow: flow,
            vni: 7000 + id,
            ..Default::default()
        },
        counter: None,
        lookup_bin: 0,
        data_pos: 0,
    }
}

fn flow(id: FlowId, shared: bool) -> EncapFlow {
    let mut flow = EncapFlow::new(
        id,
        EncapFlowParams {
            shared,
            action: EncapField::VNI | EncapField::DIP | EncapField::SIP | EncapField::L4DST,
            values: EncapValues {
                vni: 100,
                dip: IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)),
                sip: IpAddr::V4(Ipv4Addr::new(198, 51, 100, 2)),
                l4_dst: 4789,
                ..Default::default()
            },
        },
        None,
    );
    if shared {
        flow.block = Some(BlockRef::new(40, 5));
    }
    flow
}

#[test]
fn serialized_layout() {
    let condition = TunnelCondition::VNI | TunnelCondition::DIP | TunnelCondition::UDP;
    let action = RuleAction::SET_DGLORT | RuleAction::COUNTER;
    let records = vec![
        TeRecord::FlowKey(FlowKeyRecord {
            condition,
            params: ConditionParams {
                vni: 42,
                dip: v6(1),
                ..Default::default()
            },
        }),
        TeRecord::Decap(DecapRecord {
            fields: action,
            params: RuleActionParams {
                dglort: 0x1234,
                ..Default::default()
            },
            counter: 3,
        }),
    ];
    let slots = serialize(&records);
    assert_eq!(size_of(&records), 7);
    assert_eq!(
        slots,
        vec![
            u64::from(KIND_FLOW_KEY) | HDR_DIP_V6 | (u64::from(condition.bits()) << 32),
            42,
            0x2001_0db8_0000_0000,
            1,
            u64::from(KIND_DECAP) | HDR_LAST | (u64::from(action.bits()) << 32),
            0x1234,
            3,
        ]
    );
    assert_eq!(decode_block(&slots).unwrap(), records);
    assert_eq!(from_words(&to_words(&slots)), slots);
    assert_eq!(to_words(&slots[1..2]), vec![42, 0]);
}

#[test]
fn variable_headers() {
    let mut values = EncapValues {
        dip: v6(9),
        sip: v6(10),
        nsh: NshData {
            base_hdr: 0x0fc6_0102,
            service_hdr: 0x0000_10ff,
            metadata: vec![1, 2, 3],
        },
        gpe_next_prot: 4,
        ..Default::default()
    };
    let fields = EncapField::DIP
        | EncapField::SIP
        | EncapField::GPE_NEXT_PROT
        | EncapField::NSH_BASE_HDR
        | EncapField::NSH_SERVICE_HDR
        | EncapField::NSH_DATA;
    let nsh = vec![TeRecord::Encap(EncapRecord {
        fields,
        values: values.clone(),
    })];
    // header, 2 addresses, next prot, base, service, count and 2 slots of metadata
    assert_eq!(size_of(&nsh), 1 + 4 + 3 + 3);
    let slots = serialize(&nsh);
    assert_eq!(slots.len(), size_of(&nsh));
    assert_eq!(decode_block(&slots).unwrap(), nsh);

    values.nsh = NshData::default();
    values.gpe_next_prot = 0;
    values.nge.mask = 0b1000_0000_0000_0101;
    values.nge.words[0] = 0xaaaa;
    values.nge.words[2] = 0xbbbb;
    values.nge.words[15] = 0xcccc;
    let nge = vec![TeRecord::Encap(EncapRecord {
        fields: EncapField::DIP | EncapField::SIP | EncapField::NGE,
        values,
    })];
    // header, 2 addresses, mask and 2 slots of words
    assert_eq!(size_of(&nge), 1 + 4 + 3);
    let slots = serialize(&nge);
    assert_eq!(slots[6], 0xbbbb << 32 | 0xaaaa);
    assert_eq!(slots[7], 0xcccc);
    assert_eq!(decode_block(&slots).unwrap(), nge);
}

#[test]
fn decode_errors() {
    let record = TeRecord::Decap(DecapRecord {
        fields: RuleAction::SET_TTL,
        params: RuleActionParams {
            ttl: 9,
            ..Default::default()
        },
        counter: 0,
    });
    let slots = serialize(&[record.clone(), record]);
    assert!(decode_block(&slots).is_ok());
    assert_eq!(
        decode_block(&slots[..2]),
        Err(CodecError::MissingLast(2))
    );
    assert_eq!(
        decode_block(&slots[..3]),
        Err(CodecError::Truncated(3))
    );
    let mut longer = slots.clone();
    longer.push(0);
    assert_eq!(decode_block(&longer), Err(CodecError::TrailingSlots(2)));
    assert_eq!(
        decode_block(&[0x7f]),
        Err(CodecError::BadKind { kind: 0x7f, at: 0 })
    );
    assert!(matches!(
        decode_block(&[u64::from(KIND_DECAP) | HDR_LAST | (u64::from(RuleAction::ENCAP_FLOW.bits()) << 32)]),
        Err(CodecError::BadFields { .. })
    ));
}

#[test]
fn condition_checks() {
    let p = ConditionParams::default();
    assert!(validate_condition(TunnelCondition::VNI | TunnelCondition::UDP, &p).is_ok());
    assert!(matches!(
        validate_condition(TunnelCondition::UDP | TunnelCondition::TCP, &p),
        Err(TunnelError::TunnelConflict(_))
    ));
    assert!(matches!(
        validate_condition(TunnelCondition::PROT | TunnelCondition::TCP, &p),
        Err(TunnelError::TunnelConflict(_))
    ));
    assert!(matches!(
        validate_condition(TunnelCondition::empty(), &p),
        Err(TunnelError::InvalidArgument(_))
    ));
    let big = ConditionParams {
        vni: 1 << 24,
        ..Default::default()
    };
    assert!(validate_condition(TunnelCondition::VNI, &big).is_err());
}

#[test]
fn action_checks() {
    let decap = decap_group();
    let encap = encap_group(TunnelType::Vxlan);
    assert!(validate_action(&decap, RuleAction::SET_DGLORT | RuleAction::SET_TTL).is_ok());
    assert!(matches!(
        validate_action(&decap, RuleAction::ENCAP_FLOW),
        Err(TunnelError::TunnelConflict(_))
    ));
    assert!(matches!(
        validate_action(&encap, RuleAction::SET_VNI),
        Err(TunnelError::InvalidArgument(_))
    ));
    assert!(matches!(
        validate_action(&encap, RuleAction::ENCAP_FLOW | RuleAction::SET_TTL),
        Err(TunnelError::TunnelConflict(_))
    ));
}

#[test]
fn direct_rules_have_no_key() {
    let mut group = decap_group();
    group.lookup = LookupType::Direct;
    let mut rule = vni_rule(1, 10);
    rule.condition = TunnelCondition::empty();
    let records = encode_rule(&group, &rule, &BTreeMap::new()).unwrap();
    assert_eq!(records.len(), 1);
    assert!(matches!(records[0], TeRecord::Decap(_)));

    rule.action |= RuleAction::COUNTER;
    assert!(matches!(
        encode_rule(&group, &rule, &BTreeMap::new()),
        Err(TunnelError::Internal(_))
    ));
}

#[test]
fn bin_image_is_independent_of_insertion_order() {
    let group = decap_group();
    let flows = BTreeMap::new();
    let rules = [vni_rule(9, 90), vni_rule(2, 20), vni_rule(5, 50)];
    let forward = encode_bin(&group, 3, rules.iter(), &flows, 255).unwrap();
    let backward = encode_bin(&group, 3, rules.iter().rev(), &flows, 255).unwrap();
    assert_eq!(forward, backward);
    assert_eq!(forward.rule_offsets, vec![(2, 0), (5, 4), (9, 8)]);

    let decoded = decode_block(&forward.slots).unwrap();
    let vnis: Vec<u32> = decoded
        .iter()
        .filter_map(|r| match r {
            TeRecord::FlowKey(k) => Some(k.params.vni),
            _ => None,
        })
        .collect();
    assert_eq!(vnis, vec![20, 50, 90]);

    assert_eq!(
        encode_bin(&group, 3, rules.iter(), &flows, 11),
        Err(TunnelError::BinFull { bin: 3, max: 11 })
    );
}

#[test]
fn shared_flow_pointer() {
    let group = encap_group(TunnelType::Vxlan);
    let mut flows = BTreeMap::new();
    flows.insert(1, flow(1, true));
    let rules = [encap_rule(4, 1), encap_rule(3, 1)];
    let bin = encode_bin(&group, 0, rules.iter(), &flows, 255).unwrap();
    // key: header + v6 DIP, data: header + VNI + pointer
    assert_eq!(bin.rule_offsets, vec![(3, 0), (4, 6)]);
    assert_eq!(bin.flow_ptrs, vec![(1, 5), (1, 11)]);
    let ptr = flow_ptr_slot(FlowPtr {
        index: 40,
        length: 5,
    });
    assert_eq!(bin.slots[5], ptr);
    assert_eq!(bin.slots[11], ptr);

    let records = decode_block(&bin.slots).unwrap();
    let TeRecord::Encap(data) = &records[1] else {
        panic!("expected an encap record");
    };
    assert_eq!(data.fields, EncapField::VNI | EncapField::FLOW_PTR);
    assert_eq!(data.values.vni, 7003);

    assert_eq!(
        encode_bin(&group, 0, [&encap_rule(1, 2)], &flows, 255),
        Err(TunnelError::NoEncapFlow(2))
    );
}

#[test]
fn unshared_flow_is_merged() {
    let group = encap_group(TunnelType::Vxlan);
    let mut flows = BTreeMap::new();
    flows.insert(1, flow(1, false));
    let mut rule = encap_rule(3, 1);
    rule.action |= RuleAction::COUNTER;
    rule.counter = Some(17);
    let records = encode_rule(&group, &rule, &flows).unwrap();
    let TeRecord::Encap(data) = &records[1] else {
        panic!("expected an encap record");
    };
    assert_eq!(
        data.fields,
        EncapField::VNI | EncapField::DIP | EncapField::SIP | EncapField::L4DST | EncapField::COUNTER
    );
    // the rule overrides the VNI of the flow
    assert_eq!(data.values.vni, 7003);
    assert_eq!(data.values.counter, 17);
    assert_eq!(data.values.l4_dst, 4789);
    assert_eq!(data.flow_ptr_offset(), None);

    rule.action |= RuleAction::SET_NSH_BASE_HDR;
    assert!(matches!(
        encode_rule(&group, &rule, &flows),
        Err(TunnelError::TunnelType(_))
    ));
}
