//! Hierarchical token bucket layout.
//!
//! ```text
//! root M: htb default 1
//! ├── class M:1  rate <upper limit>     unshaped traffic
//! └── class M:N  rate <r> ceil <r>
//!     └── qdisc NM: netem ...
//! ```

use tcshape_shared::errors::TcshapeResult;
use tcshape_shared::units::format_rate;
use tcshape_shared::{DeviceRules, Handle, ShapingAlgorithm, ShapingParams};

use super::{MAX_RULE_MINOR, Shaper, ShaperContext, burst_bytes, first_free_minor};
use crate::capture::ToolCommand;
use crate::commands::{NetemArgs, QdiscType, TcOperation, TcTarget};

const DEFAULT_CLASS_MINOR: u16 = 1;

#[derive(Debug, Default, Clone, Copy)]
pub struct HtbShaper;

impl HtbShaper {
    fn class_args(rate_bps: u64) -> Vec<String> {
        let rate = format_rate(rate_bps);
        let burst = format!("{}b", burst_bytes(rate_bps));
        vec![
            "rate".to_string(),
            rate.clone(),
            "ceil".to_string(),
            rate,
            "burst".to_string(),
            burst.clone(),
            "cburst".to_string(),
            burst,
        ]
    }
}

impl Shaper for HtbShaper {
    fn algorithm(&self) -> ShapingAlgorithm {
        ShapingAlgorithm::Htb
    }

    fn compute_handle(&self, existing: &DeviceRules, qdisc_major: u16) -> TcshapeResult<Handle> {
        first_free_minor(existing, qdisc_major, DEFAULT_CLASS_MINOR + 1, MAX_RULE_MINOR)
    }

    fn build_queue_commands(
        &self,
        ctx: &ShaperContext,
        params: &ShapingParams,
    ) -> TcshapeResult<Vec<ToolCommand>> {
        let mut commands = Vec::new();

        if !ctx.is_change() {
            commands.push(
                ctx.qdisc()
                    .operation(TcOperation::Add)
                    .target(TcTarget::Root)
                    .handle(ctx.root_handle())
                    .kind(QdiscType::Htb)
                    .args(["default".to_string(), DEFAULT_CLASS_MINOR.to_string()])
                    .build()?,
            );
            commands.push(
                ctx.class()
                    .operation(TcOperation::Add)
                    .parent(ctx.root_handle())
                    .classid(Handle::new(ctx.qdisc_major, DEFAULT_CLASS_MINOR))
                    .kind(QdiscType::Htb)
                    .args(Self::class_args(ctx.upper_limit_bps))
                    .build()?,
            );
        }

        let rate = params.rate_bps.unwrap_or(ctx.upper_limit_bps);
        commands.push(
            ctx.class()
                .parent(ctx.root_handle())
                .classid(ctx.class_handle())
                .kind(QdiscType::Htb)
                .args(Self::class_args(rate))
                .build()?,
        );
        Ok(commands)
    }

    fn build_netem_command(
        &self,
        ctx: &ShaperContext,
        params: &ShapingParams,
    ) -> TcshapeResult<Option<ToolCommand>> {
        let netem = NetemArgs::from(params);
        if netem.is_empty() {
            return Ok(None);
        }
        ctx.qdisc()
            .parent(ctx.class_handle())
            .handle(ctx.netem_handle())
            .kind(QdiscType::Netem)
            .args(netem.into_args())
            .build()
            .map(Some)
    }

    /// The class already carries the rate.
    fn build_rate_commands(
        &self,
        _ctx: &ShaperContext,
        _params: &ShapingParams,
    ) -> TcshapeResult<Vec<ToolCommand>> {
        Ok(Vec::new())
    }
}
