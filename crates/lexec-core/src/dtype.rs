#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Hash, strum_macros::Display)]
pub enum DType {
    #[default]
    F32,
    I32,
    U32,
}

impl DType {
    /// Returns the size of the type in bytes.
    pub fn size_of(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::I32 => 4,
            DType::U32 => 4,
        }
    }

    pub fn alignment(self) -> usize {
        self.size_of()
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F32)
    }
}

pub trait TensorDType:
    Clone + std::fmt::Debug + PartialEq + 'static + num_traits::Zero + Send + Sync + bytemuck::Pod
{
    fn dt() -> DType;

    fn one() -> Self;
}

macro_rules! map_type {
    ($t:ty, $v:ident) => {
        impl TensorDType for $t {
            fn dt() -> DType {
                DType::$v
            }

            fn one() -> Self {
                1 as Self
            }
        }
    };
}

map_type!(f32, F32);
map_type!(i32, I32);
map_type!(u32, U32);
