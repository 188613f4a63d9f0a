// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Encoding of encap flows

use crate::codec::EncapRecord;
use crate::errors::TunnelError;
use crate::model::flow::{EncapField, EncapFlowParams, EncapValues, NSH_DATA_MAX_WORDS};
use crate::types::{TunnelType, check_vni};

/// Check the extension headers selected by `fields` against the tunnel type of the group
pub(crate) fn check_extensions(
    tunnel_type: TunnelType,
    fields: EncapField,
) -> Result<(), TunnelError> {
    let nge = fields.contains(EncapField::NGE);
    let gpe_nsh = fields.intersects(EncapField::GPE_NSH);
    if nge && gpe_nsh {
        return Err(TunnelError::TunnelConflict(
            "NGE and GPE/NSH headers are mutually exclusive",
        ));
    }
    if nge && tunnel_type != TunnelType::Nge {
        return Err(TunnelError::TunnelType("NGE header needs an NGE group"));
    }
    if gpe_nsh && tunnel_type != TunnelType::VxlanGpe {
        return Err(TunnelError::TunnelType(
            "GPE/NSH headers need a VXLAN-GPE group",
        ));
    }
    Ok(())
}

/// Check the values of the fields in `fields`
pub(crate) fn check_values(fields: EncapField, values: &EncapValues) -> Result<(), TunnelError> {
    if fields.contains(EncapField::VNI) {
        check_vni(values.vni)?;
    }
    if fields.contains(EncapField::NGE) && values.nge.mask == 0 {
        return Err(TunnelError::InvalidArgument("NGE header without words"));
    }
    if fields.contains(EncapField::NSH_DATA) && values.nsh.metadata.len() > NSH_DATA_MAX_WORDS {
        return Err(TunnelError::InvalidArgument(
            "NSH metadata exceeds the variable header",
        ));
    }
    Ok(())
}

/// Build the encap record of a flow. `counter` is the counter index of the flow, if any.
pub fn encode_encap_flow(
    tunnel_type: TunnelType,
    params: &EncapFlowParams,
    counter: Option<u32>,
) -> Result<EncapRecord, TunnelError> {
    let fields = params.action;
    if fields.contains(EncapField::FLOW_PTR) {
        return Err(TunnelError::InvalidArgument(
            "encap flows cannot point to other flows",
        ));
    }
    if !fields.contains(EncapField::DIP) {
        return Err(TunnelError::InvalidArgument("encap flows need a DIP"));
    }
    let v = &params.values;
    if fields.contains(EncapField::SIP) && v.sip.is_ipv6() != v.dip.is_ipv6() {
        return Err(TunnelError::TunnelConflict(
            "DIP and SIP of different address families",
        ));
    }
    check_extensions(tunnel_type, fields)?;
    check_values(fields, v)?;
    let mut values = v.masked(fields);
    if fields.contains(EncapField::COUNTER) {
        values.counter =
            counter.ok_or_else(|| TunnelError::internal("encap flow counter not reserved"))?;
    }
    Ok(EncapRecord { fields, values })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod test {
    use super::*;
    use crate::model::flow::NgeData;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    fn params(action: EncapField) -> EncapFlowParams {
        EncapFlowParams {
            shared: true,
            action,
            values: EncapValues {
                vni: 5000,
                vlan: 12,
                dip: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
                sip: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 2)),
                ..Default::default()
            },
        }
    }

    #[test]
    fn flow_record() {
        let p = params(EncapField::VNI | EncapField::DIP | EncapField::COUNTER);
        let record = encode_encap_flow(TunnelType::Vxlan, &p, Some(9)).unwrap();
        assert_eq!(record.values.vni, 5000);
        assert_eq!(record.values.counter, 9);
        // not selected by the action
        assert_eq!(record.values.vlan, 0);
        assert!(encode_encap_flow(TunnelType::Vxlan, &p, None).is_err());
    }

    #[test]
    fn flow_checks() {
        let no_dip = params(EncapField::VNI);
        assert!(matches!(
            encode_encap_flow(TunnelType::Vxlan, &no_dip, None),
            Err(TunnelError::InvalidArgument(_))
        ));

        let mut mixed = params(EncapField::DIP | EncapField::SIP);
        mixed.values.sip = IpAddr::V6(Ipv6Addr::LOCALHOST);
        assert!(matches!(
            encode_encap_flow(TunnelType::Vxlan, &mixed, None),
            Err(TunnelError::TunnelConflict(_))
        ));

        let mut nge = params(EncapField::DIP | EncapField::NGE);
        nge.values.nge = NgeData {
            mask: 1,
            ..Default::default()
        };
        assert!(matches!(
            encode_encap_flow(TunnelType::Vxlan, &nge, None),
            Err(TunnelError::TunnelType(_))
        ));
        encode_encap_flow(TunnelType::Nge, &nge, None).unwrap();

        let both = params(EncapField::DIP | EncapField::NGE | EncapField::NSH_BASE_HDR);
        assert!(matches!(
            encode_encap_flow(TunnelType::VxlanGpe, &both, None),
            Err(TunnelError::TunnelConflict(_))
        ));

        let mut nsh = params(EncapField::DIP | EncapField::NSH_DATA);
        nsh.values.nsh.metadata = vec![0; NSH_DATA_MAX_WORDS + 1];
        assert!(matches!(
            encode_encap_flow(TunnelType::VxlanGpe, &nsh, None),
            Err(TunnelError::InvalidArgument(_))
        ));
        nsh.values.nsh.metadata.pop();
        encode_encap_flow(TunnelType::VxlanGpe, &nsh, None).unwrap();

        let mut big_vni = params(EncapField::DIP | EncapField::VNI);
        big_vni.values.vni = 1 << 24;
        assert!(encode_encap_flow(TunnelType::Vxlan, &big_vni, None).is_err());
    }
}
