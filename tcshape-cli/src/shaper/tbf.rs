//! Token bucket filter layout.
//!
//! ```text
//! root M: prio bands 16
//! └── band M:N
//!     └── qdisc NM: netem ...
//!         └── qdisc TM: tbf rate <r>      (parent NM:1)
//! ```
//!
//! Bands 1-3 stay with the default priomap, rules start at band 4.

use tcshape_shared::errors::TcshapeResult;
use tcshape_shared::units::format_rate;
use tcshape_shared::{DeviceRules, Handle, ShapingAlgorithm, ShapingParams};

use super::{Shaper, ShaperContext, burst_bytes, first_free_minor};
use crate::capture::ToolCommand;
use crate::commands::{NetemArgs, QdiscType, TcOperation, TcTarget};

const PRIO_BANDS: u16 = 16;
const FIRST_RULE_BAND: u16 = 4;
const TBF_LATENCY: &str = "50ms";

#[derive(Debug, Default, Clone, Copy)]
pub struct TbfShaper;

impl Shaper for TbfShaper {
    fn algorithm(&self) -> ShapingAlgorithm {
        ShapingAlgorithm::Tbf
    }

    fn compute_handle(&self, existing: &DeviceRules, qdisc_major: u16) -> TcshapeResult<Handle> {
        first_free_minor(existing, qdisc_major, FIRST_RULE_BAND, PRIO_BANDS)
    }

    fn build_queue_commands(
        &self,
        ctx: &ShaperContext,
        _params: &ShapingParams,
    ) -> TcshapeResult<Vec<ToolCommand>> {
        if ctx.is_change() {
            return Ok(Vec::new());
        }
        // prio creates its band classes itself.
        Ok(vec![
            ctx.qdisc()
                .operation(TcOperation::Add)
                .target(TcTarget::Root)
                .handle(ctx.root_handle())
                .kind(QdiscType::Prio)
                .args(["bands".to_string(), PRIO_BANDS.to_string()])
                .build()?,
        ])
    }

    /// Always present: the tbf qdisc hangs below it.
    fn build_netem_command(
        &self,
        ctx: &ShaperContext,
        params: &ShapingParams,
    ) -> TcshapeResult<Option<ToolCommand>> {
        ctx.qdisc()
            .parent(ctx.class_handle())
            .handle(ctx.netem_handle())
            .kind(QdiscType::Netem)
            .args(NetemArgs::from(params).into_args())
            .build()
            .map(Some)
    }

    fn build_rate_commands(
        &self,
        ctx: &ShaperContext,
        params: &ShapingParams,
    ) -> TcshapeResult<Vec<ToolCommand>> {
        let Some(rate_bps) = params.rate_bps else {
            return Ok(Vec::new());
        };
        Ok(vec![
            ctx.qdisc()
                .parent(Handle::new(ctx.netem_handle().major, 1))
                .handle(ctx.tbf_handle())
                .kind(QdiscType::Tbf)
                .args([
                    "rate".to_string(),
                    format_rate(rate_bps),
                    "burst".to_string(),
                    format!("{}b", burst_bytes(rate_bps)),
                    "latency".to_string(),
                    TBF_LATENCY.to_string(),
                ])
                .build()?,
        ])
    }
}
