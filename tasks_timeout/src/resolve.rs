use crate::{
    config::{ConfigSource, TimeoutConfig},
    error::TimeoutError,
    metadata::{ClassInfo, InvocationContext},
};

/// The interception points offered by the host framework, besides class construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    TestMethod,
    TestFactory,
    TestTemplate,
    BeforeAll,
    BeforeEach,
    AfterEach,
    AfterAll,
}

/// How annotations are consulted for a [`Phase`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Policy {
    pub use_class_annotation: bool,
}

const NORMAL: Policy = Policy {
    use_class_annotation: true,
};
const LIFECYCLE: Policy = Policy {
    use_class_annotation: false,
};

const POLICIES: [(Phase, Policy); 7] = [
    (Phase::TestMethod, NORMAL),
    (Phase::TestFactory, NORMAL),
    (Phase::TestTemplate, NORMAL),
    (Phase::BeforeAll, LIFECYCLE),
    (Phase::BeforeEach, LIFECYCLE),
    (Phase::AfterEach, LIFECYCLE),
    (Phase::AfterAll, LIFECYCLE),
];

impl Phase {
    pub fn policy(self) -> Policy {
        POLICIES
            .iter()
            .find(|(phase, _)| *phase == self)
            .map_or(LIFECYCLE, |(_, policy)| *policy)
    }

    /// Test, factory and template methods; everything else is a lifecycle step.
    pub fn is_normal(self) -> bool {
        self.policy().use_class_annotation
    }
}

/// Outcome of resolving the timeout for one invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    Timed {
        config: TimeoutConfig,
        source: ConfigSource,
    },
    ProceedUnmodified,
}

impl Resolution {
    pub fn source(&self) -> ConfigSource {
        match self {
            Resolution::Timed { source, .. } => *source,
            Resolution::ProceedUnmodified => ConfigSource::None,
        }
    }
}

/// Picks the single authoritative timeout for an invocation.
///
/// `registration` is the configuration the instance was built with, if any. It
/// can never be combined with annotations: finding one next to it is a conflict.
/// Without a registration the method annotation wins, then the class annotation
/// for phases whose policy allows it.
pub fn resolve(
    registration: Option<TimeoutConfig>,
    phase: Phase,
    ctx: &InvocationContext,
) -> Result<Resolution, TimeoutError> {
    let method_annotation = ctx.method().annotation();
    let class_annotation = ctx.test_class().and_then(ClassInfo::find_annotation);

    if let Some(config) = registration {
        if method_annotation.is_some() || class_annotation.is_some() {
            return Err(TimeoutError::ConfigurationConflict {
                method: ctx.method().name().to_string(),
            });
        }
        return Ok(Resolution::Timed {
            config,
            source: ConfigSource::Registration,
        });
    }

    match (method_annotation, class_annotation) {
        (Some(annotation), _) => Ok(Resolution::Timed {
            config: annotation.into(),
            source: ConfigSource::MethodAnnotation,
        }),
        (None, Some(annotation)) if phase.policy().use_class_annotation => Ok(Resolution::Timed {
            config: annotation.into(),
            source: ConfigSource::ClassAnnotation,
        }),
        (None, Some(_)) => Ok(Resolution::ProceedUnmodified),
        (None, None) => Err(TimeoutError::ResolutionInconsistency {
            method: ctx.method().name().to_string(),
        }),
    }
}
