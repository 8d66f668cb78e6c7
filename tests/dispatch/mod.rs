mod broadcast_case1;
