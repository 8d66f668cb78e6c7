mod checkpoint_case1;
