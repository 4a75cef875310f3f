//! Control flow signals returned by steps

/// How a step finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Continue with the next sibling
    Completed,
    /// Unwind `count` enclosing sequence/loop levels
    Break {
        count: u32,
        /// Resume the construct where the count reaches zero
        resume: bool,
    },
    /// The run was aborted, stop without running anything else
    Aborted,
}

/// What a sequence or loop does with a break it receives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakOutcome {
    /// Levels remain, hand the reduced break to the parent
    Propagate(Flow),
    /// The break ends here and the construct carries on
    Resume,
    /// The break ends here and the construct stops
    Stop,
}

impl Flow {
    /// Consume one level of a break
    pub fn consume_break(count: u32, resume: bool) -> BreakOutcome {
        let remaining = count.saturating_sub(1);
        if remaining > 0 {
            BreakOutcome::Propagate(Flow::Break {
                count: remaining,
                resume,
            })
        } else if resume {
            BreakOutcome::Resume
        } else {
            BreakOutcome::Stop
        }
    }
}
