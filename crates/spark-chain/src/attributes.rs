use std::{
    any::Any,
    collections::HashMap,
    fmt,
    marker::PhantomData,
    sync::Arc,
};

/// 类型化属性键。
///
/// 键名在同一个 [`Attributes`] 内唯一；同名不同类型的键会互相覆盖，读取时类型不符返回 `None`。
pub struct AttributeKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AttributeKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for AttributeKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for AttributeKey<T> {}

impl<T> fmt::Debug for AttributeKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AttributeKey").field(&self.name).finish()
    }
}

/// Pipeline 附带的属性表，供特性在安装期存放自身状态（例如“已安装”标记或共享计数器）。
///
/// # 教案式说明
/// - **逻辑（How）**：值以 `Arc<dyn Any + Send + Sync>` 存放，克隆属性表只复制引用；
/// - **契约（What）**：属性不参与执行，也不会在 `merge` 时合并，仅 `Pipeline::clone` 时整体复制。
#[derive(Clone, Default)]
pub struct Attributes {
    values: HashMap<&'static str, Arc<dyn Any + Send + Sync>>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入属性，覆盖同名旧值。
    pub fn put<T: Send + Sync + 'static>(&mut self, key: AttributeKey<T>, value: T) {
        self.values.insert(key.name, Arc::new(value));
    }

    pub fn get<T: Send + Sync + 'static>(&self, key: AttributeKey<T>) -> Option<&T> {
        self.values
            .get(key.name)
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn contains<T: Send + Sync + 'static>(&self, key: AttributeKey<T>) -> bool {
        self.get(key).is_some()
    }

    /// 移除属性；仅当存储值类型与键匹配时返回其共享引用。
    pub fn remove<T: Send + Sync + 'static>(&mut self, key: AttributeKey<T>) -> Option<Arc<T>> {
        self.values
            .remove(key.name)
            .and_then(|value| value.downcast::<T>().ok())
    }

    /// 读取属性，不存在（或类型不符）时以 `init` 的结果写入后返回。
    pub fn get_or_insert_with<T, F>(&mut self, key: AttributeKey<T>, init: F) -> &T
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        if !self.contains(key) {
            self.put(key, init());
        }
        match self
            .values
            .get(key.name)
            .and_then(|value| value.downcast_ref::<T>())
        {
            Some(value) => value,
            None => unreachable!("属性 `{}` 刚写入却无法按原类型读取", key.name),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.values.keys().collect();
        names.sort_unstable();
        f.debug_struct("Attributes").field("keys", &names).finish()
    }
}
