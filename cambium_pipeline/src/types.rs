// Copyright 2025 the Cambium Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Value types for pipeline and layer state groups, plus capabilities and
//! the recoverable error type.

/// An RGBA color with 8 bits per channel.
///
/// Colors compare exactly, byte for byte; there is no epsilon involved in
/// equality or in render-equivalence decisions.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Color {
    /// Red channel.
    pub r: u8,
    /// Green channel.
    pub g: u8,
    /// Blue channel.
    pub b: u8,
    /// Alpha channel. `0xff` is fully opaque.
    pub a: u8,
}

impl Color {
    /// Opaque white, the default pipeline color.
    pub const WHITE: Self = Self::new(0xff, 0xff, 0xff, 0xff);
    /// Transparent black.
    pub const TRANSPARENT: Self = Self::new(0, 0, 0, 0);

    /// Create a color from channel bytes.
    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// True when the alpha channel is fully opaque.
    pub const fn is_opaque(self) -> bool {
        self.a == 0xff
    }
}

/// How blending is decided for a pipeline.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BlendMode {
    /// Enable blending whenever any state could produce alpha < 1.
    #[default]
    Automatic,
    /// Blending is always on.
    Enabled,
    /// Blending is always off.
    Disabled,
}

/// Blend equation applied to source and destination terms.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BlendEquation {
    /// `src * sf + dst * df`
    #[default]
    Add,
    /// `src * sf - dst * df`
    Subtract,
    /// `dst * df - src * sf`
    ReverseSubtract,
}

/// Multiplier applied to a blend term.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs, reason = "Factor names follow the standard GPU blend factor vocabulary.")]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstColor,
    OneMinusDstColor,
    DstAlpha,
    OneMinusDstAlpha,
    SrcAlphaSaturate,
    ConstantColor,
    OneMinusConstantColor,
    ConstantAlpha,
    OneMinusConstantAlpha,
}

/// Full blend configuration for a pipeline.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BlendState {
    /// Equation for the color channels.
    pub equation_rgb: BlendEquation,
    /// Equation for the alpha channel.
    pub equation_alpha: BlendEquation,
    /// Source factor for the color channels.
    pub src_factor_rgb: BlendFactor,
    /// Destination factor for the color channels.
    pub dst_factor_rgb: BlendFactor,
    /// Source factor for the alpha channel.
    pub src_factor_alpha: BlendFactor,
    /// Destination factor for the alpha channel.
    pub dst_factor_alpha: BlendFactor,
    /// Constant color referenced by the `Constant*` factors.
    pub constant: Color,
}

impl Default for BlendState {
    /// Premultiplied-alpha over, the conventional default.
    fn default() -> Self {
        Self {
            equation_rgb: BlendEquation::Add,
            equation_alpha: BlendEquation::Add,
            src_factor_rgb: BlendFactor::One,
            dst_factor_rgb: BlendFactor::OneMinusSrcAlpha,
            src_factor_alpha: BlendFactor::One,
            dst_factor_alpha: BlendFactor::OneMinusSrcAlpha,
            constant: Color::TRANSPARENT,
        }
    }
}

impl BlendState {
    /// True when this configuration is equivalent to blending being
    /// disabled: a plain `Add` of `(One, OneMinusSrcAlpha)` with no source
    /// alpha below one.
    pub(crate) fn is_effectively_opaque_over(&self) -> bool {
        self.equation_rgb == BlendEquation::Add
            && self.equation_alpha == BlendEquation::Add
            && self.src_factor_rgb == BlendFactor::One
            && self.dst_factor_rgb == BlendFactor::OneMinusSrcAlpha
            && self.src_factor_alpha == BlendFactor::One
            && self.dst_factor_alpha == BlendFactor::OneMinusSrcAlpha
    }
}

/// Comparison function for the alpha test.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[allow(missing_docs, reason = "Standard comparison function vocabulary.")]
pub enum AlphaFunc {
    Never,
    Less,
    Equal,
    Lequal,
    Greater,
    NotEqual,
    Gequal,
    #[default]
    Always,
}

/// Alpha-test configuration.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AlphaState {
    /// Test applied to the fragment alpha.
    pub func: AlphaFunc,
    /// Reference value compared against.
    pub reference: f32,
}

impl Default for AlphaState {
    fn default() -> Self {
        Self {
            func: AlphaFunc::Always,
            reference: 0.0,
        }
    }
}

/// Comparison function for the depth test.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[allow(missing_docs, reason = "Standard comparison function vocabulary.")]
pub enum DepthTestFunction {
    Never,
    #[default]
    Less,
    Equal,
    Lequal,
    Greater,
    NotEqual,
    Gequal,
    Always,
}

/// Depth-buffer configuration.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DepthState {
    /// Whether fragments are depth tested.
    pub test_enabled: bool,
    /// Whether fragments write their depth.
    pub write_enabled: bool,
    /// Comparison used when testing.
    pub test_function: DepthTestFunction,
    /// Near end of the depth range mapping.
    pub range_near: f32,
    /// Far end of the depth range mapping.
    pub range_far: f32,
}

impl Default for DepthState {
    fn default() -> Self {
        Self {
            test_enabled: false,
            write_enabled: true,
            test_function: DepthTestFunction::Less,
            range_near: 0.0,
            range_far: 1.0,
        }
    }
}

/// Fog falloff curve.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FogMode {
    /// Linear falloff between `z_near` and `z_far`.
    #[default]
    Linear,
    /// Exponential falloff by `density`.
    Exponential,
    /// Squared exponential falloff by `density`.
    ExponentialSquared,
}

/// Fog configuration.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct FogState {
    /// Whether fog is applied at all.
    pub enabled: bool,
    /// Fog color.
    pub color: Color,
    /// Falloff curve.
    pub mode: FogMode,
    /// Density for the exponential modes.
    pub density: f32,
    /// Start depth for linear fog.
    pub z_near: f32,
    /// End depth for linear fog.
    pub z_far: f32,
}

impl Default for FogState {
    fn default() -> Self {
        Self {
            enabled: false,
            color: Color::TRANSPARENT,
            mode: FogMode::Linear,
            density: 0.0,
            z_near: 0.0,
            z_far: 1.0,
        }
    }
}

/// Material lighting parameters.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LightingState {
    /// Ambient reflectance, RGBA.
    pub ambient: [f32; 4],
    /// Diffuse reflectance, RGBA.
    pub diffuse: [f32; 4],
    /// Specular reflectance, RGBA.
    pub specular: [f32; 4],
    /// Emitted light, RGBA.
    pub emission: [f32; 4],
    /// Specular exponent.
    pub shininess: f32,
}

impl Default for LightingState {
    fn default() -> Self {
        Self {
            ambient: [0.2, 0.2, 0.2, 1.0],
            diffuse: [0.8, 0.8, 0.8, 1.0],
            specular: [0.0, 0.0, 0.0, 1.0],
            emission: [0.0, 0.0, 0.0, 1.0],
            shininess: 0.0,
        }
    }
}

/// Texture sampling filter.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[allow(missing_docs, reason = "Standard texture filter vocabulary.")]
pub enum Filter {
    Nearest,
    #[default]
    Linear,
    NearestMipmapNearest,
    LinearMipmapNearest,
    NearestMipmapLinear,
    LinearMipmapLinear,
}

/// Texture coordinate wrap behavior.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum WrapMode {
    /// Let the renderer pick based on how the geometry uses coordinates.
    #[default]
    Automatic,
    /// Tile the texture.
    Repeat,
    /// Clamp coordinates to the edge texel.
    ClampToEdge,
    /// Tile with alternate mirroring.
    MirroredRepeat,
}

/// Texture combine function for a layer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[allow(missing_docs, reason = "Standard texture combine vocabulary.")]
pub enum CombineFunc {
    Replace,
    #[default]
    Modulate,
    Add,
    AddSigned,
    Interpolate,
    Subtract,
    Dot3Rgb,
    Dot3Rgba,
}

impl CombineFunc {
    /// How many source arguments this function consumes. Slots beyond this
    /// count are not meaningful and are ignored by copies and comparisons.
    pub const fn n_args(self) -> usize {
        match self {
            Self::Replace => 1,
            Self::Modulate
            | Self::Add
            | Self::AddSigned
            | Self::Subtract
            | Self::Dot3Rgb
            | Self::Dot3Rgba => 2,
            Self::Interpolate => 3,
        }
    }
}

/// Where a combine argument reads from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CombineSource {
    /// This layer's texture.
    Texture,
    /// The texture bound to an explicit unit.
    TextureUnit(u8),
    /// The combine constant color.
    Constant,
    /// The fragment's primary color.
    PrimaryColor,
    /// The result of the previous layer (or the primary color for unit 0).
    Previous,
}

/// Which channels of a combine source feed the argument.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs, reason = "Standard combine operand vocabulary.")]
pub enum CombineOp {
    SrcColor,
    OneMinusSrcColor,
    SrcAlpha,
    OneMinusSrcAlpha,
}

/// Full texture combine configuration for a layer.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CombineState {
    /// Function combining the color channels.
    pub rgb_func: CombineFunc,
    /// Color sources, `rgb_func.n_args()` of which are meaningful.
    pub rgb_src: [CombineSource; 3],
    /// Color operands, paired with `rgb_src`.
    pub rgb_op: [CombineOp; 3],
    /// Function combining the alpha channel.
    pub alpha_func: CombineFunc,
    /// Alpha sources, `alpha_func.n_args()` of which are meaningful.
    pub alpha_src: [CombineSource; 3],
    /// Alpha operands, paired with `alpha_src`.
    pub alpha_op: [CombineOp; 3],
}

impl Default for CombineState {
    /// The conventional default: `Modulate(Previous, Texture)` on both the
    /// color and alpha channels.
    fn default() -> Self {
        Self {
            rgb_func: CombineFunc::Modulate,
            rgb_src: [
                CombineSource::Previous,
                CombineSource::Texture,
                CombineSource::Previous,
            ],
            rgb_op: [CombineOp::SrcColor; 3],
            alpha_func: CombineFunc::Modulate,
            alpha_src: [
                CombineSource::Previous,
                CombineSource::Texture,
                CombineSource::Previous,
            ],
            alpha_op: [CombineOp::SrcAlpha; 3],
        }
    }
}

impl CombineState {
    /// True when the alpha side is the default `Modulate(Previous, Texture)`
    /// chain, which passes the previous alpha through multiplied by the
    /// texture alpha. Anything else is assumed to be able to produce
    /// alpha < 1.
    pub(crate) fn alpha_is_default_modulate(&self) -> bool {
        self.alpha_func == CombineFunc::Modulate
            && self.alpha_src[0] == CombineSource::Previous
            && self.alpha_op[0] == CombineOp::SrcAlpha
            && self.alpha_src[1] == CombineSource::Texture
            && self.alpha_op[1] == CombineOp::SrcAlpha
    }
}

/// Opaque reference to a texture owned by the renderer.
///
/// The texture object itself lives outside this crate; the pipeline tree only
/// needs identity (for equality) and whether the format carries alpha (for
/// automatic blend enabling).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TextureHandle {
    /// Renderer-assigned identity.
    pub id: u64,
    /// Whether the texture format has an alpha component.
    pub has_alpha: bool,
}

/// Opaque reference to a user-supplied shader program.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProgramHandle(pub u64);

/// Renderer capabilities that gate optional pipeline features.
#[derive(Copy, Clone, Debug)]
pub struct Capabilities {
    /// Whether point sprite texture coordinates are supported.
    pub point_sprite_coords: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            point_sprite_coords: true,
        }
    }
}

/// Recoverable configuration errors. The tree is left unmodified when one of
/// these is returned.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum PipelineError {
    /// Point sprite texture coordinates were requested but the renderer does
    /// not support them.
    PointSpriteCoordsUnsupported,
    /// A shininess value outside the supported range was supplied.
    InvalidShininess(f32),
}

impl core::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::PointSpriteCoordsUnsupported => write!(
                f,
                "point sprite texture coordinates are not supported by the renderer"
            ),
            Self::InvalidShininess(v) => write!(f, "out of range shininess {v}"),
        }
    }
}

impl core::error::Error for PipelineError {}
